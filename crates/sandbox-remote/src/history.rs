//! Bounded command history polled by the UI

use sandbox_core::CommandHistoryEntry;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Ring buffer of executed commands. The oldest entry is evicted once
/// `capacity` is reached.
pub struct CommandHistory {
    capacity: usize,
    entries: Mutex<VecDeque<CommandHistoryEntry>>,
}

impl CommandHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, VecDeque<CommandHistoryEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, entry: CommandHistoryEntry) {
        let mut entries = self.entries();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Entries oldest first
    pub fn snapshot(&self) -> Vec<CommandHistoryEntry> {
        self.entries().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new(500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_core::CommandOutput;

    fn entry(command: &str) -> CommandHistoryEntry {
        CommandHistoryEntry::new(command, &CommandOutput::new("", ""), "/work")
    }

    #[test]
    fn test_evicts_oldest() {
        let history = CommandHistory::new(3);
        for i in 0..5 {
            history.record(entry(&format!("echo {}", i)));
        }

        let commands: Vec<String> = history.snapshot().into_iter().map(|e| e.command).collect();
        assert_eq!(commands, vec!["echo 2", "echo 3", "echo 4"]);
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let history = CommandHistory::new(0);
        history.record(entry("a"));
        history.record(entry("b"));
        assert_eq!(history.capacity(), 1);
        assert_eq!(history.snapshot()[0].command, "b");
    }

    #[test]
    fn test_clear() {
        let history = CommandHistory::default();
        history.record(entry("ls"));
        assert!(!history.is_empty());
        history.clear();
        assert!(history.is_empty());
    }
}
