//! Bounded queue of reliable server commands for one client
//!
//! Commands get contiguous indices starting at 1. Every outbound datagram
//! carries all commands above the client's acknowledged index, so a
//! command keeps being resent until the client acknowledges it. Clients
//! de-duplicate by index.

use shared::{ReliableCommand, MAX_RELIABLE_COMMANDS};

use crate::session::SessionError;

#[derive(Debug)]
pub struct ReliableQueue {
    commands: Vec<String>,
    /// Index of the most recently enqueued command
    sequence: u32,
    /// Highest index the client has acknowledged
    acknowledged: u32,
}

impl Default for ReliableQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableQueue {
    pub fn new() -> Self {
        Self {
            commands: vec![String::new(); MAX_RELIABLE_COMMANDS],
            sequence: 0,
            acknowledged: 0,
        }
    }

    /// Appends a command, returning its index
    ///
    /// Fails with `QueueFull` when the client already has the maximum number
    /// of unacknowledged commands.
    pub fn enqueue(&mut self, command: impl Into<String>) -> Result<u32, SessionError> {
        if self.pending_len() >= MAX_RELIABLE_COMMANDS {
            return Err(SessionError::QueueFull);
        }

        self.sequence += 1;
        let slot = self.sequence as usize % MAX_RELIABLE_COMMANDS;
        self.commands[slot] = command.into();
        Ok(self.sequence)
    }

    /// Marks every command up to `index` as delivered
    ///
    /// Acknowledgements never move backwards. An index beyond anything sent
    /// is rejected without changing the queue.
    pub fn acknowledge(&mut self, index: u32) -> Result<(), SessionError> {
        if index > self.sequence {
            return Err(SessionError::AckOutOfRange {
                ack: index,
                latest: self.sequence,
            });
        }
        self.acknowledged = self.acknowledged.max(index);
        Ok(())
    }

    pub fn pending_len(&self) -> usize {
        (self.sequence - self.acknowledged) as usize
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn acknowledged(&self) -> u32 {
        self.acknowledged
    }

    /// Unacknowledged commands in index order
    pub fn pending(&self) -> Vec<ReliableCommand> {
        (self.acknowledged + 1..=self.sequence)
            .map(|index| ReliableCommand {
                index,
                text: self.commands[index as usize % MAX_RELIABLE_COMMANDS].clone(),
            })
            .collect()
    }
}
