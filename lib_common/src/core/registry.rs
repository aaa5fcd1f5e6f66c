//! # Subscription Registry
//!
//! Channel set for one connection. The registry only decides *what* to send;
//! the session loop owns the link and writes the returned messages.
use serde_json::{json, Value};

use crate::core::model::{channel_filters, ControlMessage, MessageType, Scope};

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    // Insertion ordered; resubscription replays in the same order.
    channels: Vec<String>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds each channel (set semantics) and returns one `subscribe` per channel,
    /// duplicates included.
    pub fn subscribe(&mut self, channels: &[String], scope: &Scope) -> Vec<ControlMessage> {
        channels
            .iter()
            .map(|channel| {
                if !self.contains(channel) {
                    self.channels.push(channel.clone());
                }
                subscribe_message(channel, scope)
            })
            .collect()
    }

    /// Removes each channel and returns one `unsubscribe` per channel.
    pub fn unsubscribe(&mut self, channels: &[String]) -> Vec<ControlMessage> {
        channels
            .iter()
            .map(|channel| {
                self.channels.retain(|c| c != channel);
                unsubscribe_message(channel)
            })
            .collect()
    }

    /// Full unsubscribe-then-resubscribe over every active channel, so filters
    /// pick up the new scope. The set itself is unchanged.
    pub fn resync(&self, scope: &Scope) -> Vec<ControlMessage> {
        let mut messages: Vec<ControlMessage> = self.channels.iter().map(|c| unsubscribe_message(c)).collect();
        messages.extend(self.channels.iter().map(|c| subscribe_message(c, scope)));
        messages
    }

    /// `subscribe` for every active channel, used after a reconnect.
    pub fn replay(&self, scope: &Scope) -> Vec<ControlMessage> {
        self.channels.iter().map(|c| subscribe_message(c, scope)).collect()
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

fn subscribe_message(channel: &str, scope: &Scope) -> ControlMessage {
    let filters: Value = channel_filters(channel);
    ControlMessage::outbound(
        MessageType::Subscribe,
        Some(channel.to_string()),
        Some(json!({ "sport": scope.sport, "filters": filters })),
    )
}

fn unsubscribe_message(channel: &str) -> ControlMessage {
    ControlMessage::outbound(MessageType::Unsubscribe, Some(channel.to_string()), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chans(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn summary(messages: &[ControlMessage]) -> Vec<(MessageType, String)> {
        messages
            .iter()
            .map(|m| (m.kind, m.channel.clone().unwrap_or_default()))
            .collect()
    }

    #[test]
    fn resubscribe_is_idempotent_but_not_deduplicated() {
        let mut reg = SubscriptionRegistry::new();
        let scope = Scope::sport("NFL");
        let first = reg.subscribe(&chans(&["live_scores"]), &scope);
        let second = reg.subscribe(&chans(&["live_scores"]), &scope);

        assert_eq!(reg.len(), 1);
        assert_eq!(first.len() + second.len(), 2);
        assert_eq!(second[0].kind, MessageType::Subscribe);
    }

    #[test]
    fn subscribe_payload_merges_template_and_sport() {
        let mut reg = SubscriptionRegistry::new();
        let msgs = reg.subscribe(&chans(&["player_stats"]), &Scope::sport("NBA"));
        let data = msgs[0].data.as_ref().unwrap();
        assert_eq!(data["sport"], "NBA");
        assert_eq!(data["filters"]["includeAdvanced"], true);
        assert_eq!(data["filters"]["realTimeOnly"], true);
    }

    #[test]
    fn unsubscribe_removes_and_always_sends() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe(&chans(&["live_scores", "game_events"]), &Scope::default());
        let msgs = reg.unsubscribe(&chans(&["live_scores", "never_subscribed"]));
        assert_eq!(
            summary(&msgs),
            vec![
                (MessageType::Unsubscribe, "live_scores".to_string()),
                (MessageType::Unsubscribe, "never_subscribed".to_string())
            ]
        );
        assert_eq!(reg.channels(), &["game_events".to_string()]);
    }

    #[test]
    fn resync_unsubscribes_all_then_resubscribes_with_new_scope() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe(&chans(&["live_scores", "player_stats"]), &Scope::sport("NFL"));
        let msgs = reg.resync(&Scope::sport("NBA"));
        assert_eq!(
            summary(&msgs),
            vec![
                (MessageType::Unsubscribe, "live_scores".to_string()),
                (MessageType::Unsubscribe, "player_stats".to_string()),
                (MessageType::Subscribe, "live_scores".to_string()),
                (MessageType::Subscribe, "player_stats".to_string()),
            ]
        );
        assert!(msgs[2..].iter().all(|m| m.data.as_ref().unwrap()["sport"] == "NBA"));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn clear_empties_set() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe(&chans(&["a"]), &Scope::default());
        reg.clear();
        assert!(reg.is_empty());
        assert!(reg.resync(&Scope::default()).is_empty());
    }
}
