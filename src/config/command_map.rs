//! Command availability and renaming
//!
//! Some deployments rename or disable commands (`rename-command` on the
//! server, or proxies that only forward data commands). The map decides
//! which liveness verbs are legal and what name goes on the wire.

use std::collections::{HashMap, HashSet};

/// Availability and wire names of commands
#[derive(Debug, Clone, Default)]
pub struct CommandMap {
    /// Upper-cased command names that must not be sent
    disabled: HashSet<String>,
    /// Upper-cased command name -> name to send instead
    renamed: HashMap<String, String>,
}

impl CommandMap {
    /// Commands a twemproxy-style proxy does not forward
    pub fn twemproxy() -> Self {
        Self::default().disable(&[
            "ECHO", "PING", "INFO", "CLUSTER", "CONFIG", "CLIENT", "SELECT", "PUBLISH",
            "SUBSCRIBE", "ROLE", "REPLICAOF", "SLAVEOF", "SCRIPT", "KEYS", "SCAN",
        ])
    }

    /// Commands a sentinel does not implement
    pub fn sentinel() -> Self {
        Self::default().disable(&["GET", "SET", "ECHO", "CLUSTER", "SELECT", "PUBLISH"])
    }

    pub fn disable(mut self, commands: &[&str]) -> Self {
        for cmd in commands {
            self.disabled.insert(cmd.to_ascii_uppercase());
        }
        self
    }

    pub fn rename(mut self, command: &str, wire_name: &str) -> Self {
        self.renamed
            .insert(command.to_ascii_uppercase(), wire_name.to_string());
        self
    }

    /// Whether a command may be sent
    pub fn is_available(&self, command: &str) -> bool {
        if self.disabled.is_empty() {
            return true;
        }
        !self.disabled.contains(&command.to_ascii_uppercase())
    }

    /// Name to put on the wire for `command`
    pub fn wire_name<'a>(&'a self, command: &'a str) -> &'a str {
        if self.renamed.is_empty() {
            return command;
        }
        self.renamed
            .get(&command.to_ascii_uppercase())
            .map(String::as_str)
            .unwrap_or(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allows_everything() {
        let map = CommandMap::default();
        assert!(map.is_available("info"));
        assert_eq!(map.wire_name("CONFIG"), "CONFIG");
    }

    #[test]
    fn test_disable_is_case_insensitive() {
        let map = CommandMap::twemproxy();
        assert!(!map.is_available("ping"));
        assert!(!map.is_available("Info"));
        assert!(map.is_available("GET"));
    }

    #[test]
    fn test_rename() {
        let map = CommandMap::default().rename("config", "CFG-7f3a");
        assert_eq!(map.wire_name("CONFIG"), "CFG-7f3a");
        assert_eq!(map.wire_name("GET"), "GET");
    }
}
