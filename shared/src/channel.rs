//! Sequenced datagram channel
//!
//! Wraps an unreliable transport with a strictly increasing sequence number
//! per outbound message. Inbound messages at or below the highest accepted
//! sequence are rejected, which discards both duplicates and replays.
//!
//! Messages larger than the fragment size are split into fragments sharing
//! one sequence. Reassembly is single-slot: a fragment of a different
//! message discards whatever was partially collected. That bounds memory per
//! peer, at the cost that a peer interleaving two fragment streams can keep
//! either from ever completing. This is an accepted risk.

use crate::{ProtocolError, FRAGMENT_BIT, FRAGMENT_SIZE, MAX_FRAGMENTS, OUT_OF_BAND};

/// Decoded datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    /// Connectionless packet, not subject to sequencing
    OutOfBand,
    Sequenced {
        sequence: u32,
        /// `(index, count)` when the datagram is one fragment of a message
        fragment: Option<(u16, u16)>,
    },
}

impl Header {
    /// Bytes occupied by the header itself
    pub fn len(&self) -> usize {
        match self {
            Header::Sequenced {
                fragment: Some(_), ..
            } => 8,
            _ => 4,
        }
    }
}

/// Parses the header at the start of a datagram
pub fn read_header(datagram: &[u8]) -> Result<Header, ProtocolError> {
    let word = datagram
        .get(0..4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(ProtocolError::Truncated)?;

    if word == OUT_OF_BAND {
        return Ok(Header::OutOfBand);
    }

    if word & FRAGMENT_BIT == 0 {
        return Ok(Header::Sequenced {
            sequence: word,
            fragment: None,
        });
    }

    let extra = datagram.get(4..8).ok_or(ProtocolError::Truncated)?;
    let index = u16::from_le_bytes([extra[0], extra[1]]);
    let count = u16::from_le_bytes([extra[2], extra[3]]);
    if count == 0 || index >= count || count as usize > MAX_FRAGMENTS {
        return Err(ProtocolError::BadFragment { index, count });
    }

    Ok(Header::Sequenced {
        sequence: word & !FRAGMENT_BIT,
        fragment: Some((index, count)),
    })
}

/// Prefixes a connectionless payload with the out-of-band marker
pub fn write_out_of_band(payload: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(payload.len() + 4);
    datagram.extend_from_slice(&OUT_OF_BAND.to_le_bytes());
    datagram.extend_from_slice(payload);
    datagram
}

/// Outcome of feeding one datagram to a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A whole message was accepted
    Complete { sequence: u32, payload: Vec<u8> },
    /// A fragment was accepted; the message is not complete yet
    Pending,
    /// Stale or duplicate datagram, dropped
    Rejected,
}

#[derive(Debug)]
struct Reassembly {
    sequence: u32,
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

/// One direction pair of a sequenced connection
#[derive(Debug)]
pub struct SequencedChannel {
    /// Sequence the next outbound message gets
    outgoing_sequence: u32,
    /// Highest inbound sequence accepted so far, 0 before the first
    incoming_sequence: u32,
    fragment_size: usize,
    reassembly: Option<Reassembly>,
}

impl Default for SequencedChannel {
    fn default() -> Self {
        Self::new(FRAGMENT_SIZE)
    }
}

impl SequencedChannel {
    pub fn new(fragment_size: usize) -> Self {
        Self {
            outgoing_sequence: 1,
            incoming_sequence: 0,
            fragment_size: fragment_size.max(1),
            reassembly: None,
        }
    }

    /// Sequence that will be assigned to the next outbound message
    pub fn outgoing_sequence(&self) -> u32 {
        self.outgoing_sequence
    }

    /// Highest inbound sequence accepted, 0 before the first message
    pub fn incoming_sequence(&self) -> u32 {
        self.incoming_sequence
    }

    /// Assigns the next sequence to `payload` and frames it into datagrams.
    ///
    /// A payload needing more than [`MAX_FRAGMENTS`] fragments is refused
    /// without consuming a sequence.
    pub fn send(&mut self, payload: &[u8]) -> Result<(u32, Vec<Vec<u8>>), ProtocolError> {
        let count = payload.len().div_ceil(self.fragment_size);
        if count > MAX_FRAGMENTS {
            return Err(ProtocolError::Oversized {
                len: payload.len(),
                max: MAX_FRAGMENTS,
            });
        }

        let sequence = self.outgoing_sequence;
        self.outgoing_sequence += 1;
        debug_assert!(self.outgoing_sequence < FRAGMENT_BIT);

        if payload.len() <= self.fragment_size {
            let mut datagram = Vec::with_capacity(payload.len() + 4);
            datagram.extend_from_slice(&sequence.to_le_bytes());
            datagram.extend_from_slice(payload);
            return Ok((sequence, vec![datagram]));
        }

        let count = count as u16;
        let datagrams = payload
            .chunks(self.fragment_size)
            .enumerate()
            .map(|(index, chunk)| {
                let mut datagram = Vec::with_capacity(chunk.len() + 8);
                datagram.extend_from_slice(&(sequence | FRAGMENT_BIT).to_le_bytes());
                datagram.extend_from_slice(&(index as u16).to_le_bytes());
                datagram.extend_from_slice(&count.to_le_bytes());
                datagram.extend_from_slice(chunk);
                datagram
            })
            .collect();

        Ok((sequence, datagrams))
    }

    /// Accepts, buffers or rejects one inbound sequenced datagram
    pub fn receive(&mut self, datagram: &[u8]) -> Result<Received, ProtocolError> {
        let header = read_header(datagram)?;
        let Header::Sequenced { sequence, fragment } = header else {
            return Err(ProtocolError::UnexpectedOutOfBand);
        };

        if sequence <= self.incoming_sequence {
            return Ok(Received::Rejected);
        }

        let body = &datagram[header.len()..];
        let Some((index, count)) = fragment else {
            self.reassembly = None;
            self.incoming_sequence = sequence;
            return Ok(Received::Complete {
                sequence,
                payload: body.to_vec(),
            });
        };

        let fresh = match &self.reassembly {
            Some(r) => r.sequence != sequence || r.parts.len() != count as usize,
            None => true,
        };
        if fresh {
            self.reassembly = Some(Reassembly {
                sequence,
                parts: vec![None; count as usize],
                received: 0,
            });
        }

        let Some(reassembly) = self.reassembly.as_mut() else {
            return Ok(Received::Pending);
        };

        let slot = &mut reassembly.parts[index as usize];
        if slot.is_some() {
            return Ok(Received::Rejected);
        }
        *slot = Some(body.to_vec());
        reassembly.received += 1;

        if reassembly.received < reassembly.parts.len() {
            return Ok(Received::Pending);
        }

        let payload = reassembly.parts.iter().flatten().flatten().copied().collect();
        self.reassembly = None;
        self.incoming_sequence = sequence;

        Ok(Received::Complete { sequence, payload })
    }
}
