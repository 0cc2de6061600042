//! # Back-Channel
//!
//! The in-memory handoff that carries a partition's workset from the end of superstep `n`
//! to the head of superstep `n + 1`, replacing network shipment for the cyclic edge.
//!
//! One [`BackChannel`] exists per (iteration id, partition, superstep transition). The
//! single legal access pattern is: the producer writes and closes; the consumer reads
//! once, after the close. Everything else is a protocol violation. Instances are created on
//! demand by the [`BackChannelBroker`] and dropped after the read, so the cycle in the
//! dataflow becomes a sequence of disposable point-to-point handoffs.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::config::IterationConfig;
use crate::constants::events;
use crate::error::{IterationError, Result};
use crate::logging::log_back_channel_operation;
use crate::record::Record;
use crate::store::{RetryPolicy, SpillFile};

/// Memory and spill settings shared by all back-channels of a scope
#[derive(Debug, Clone)]
pub struct BackChannelSettings {
    pub memory_budget_bytes: usize,
    pub spill_directory: PathBuf,
    pub retry: RetryPolicy,
}

impl BackChannelSettings {
    pub fn from_config(config: &IterationConfig) -> Self {
        Self {
            memory_budget_bytes: config.memory.back_channel_memory_bytes,
            spill_directory: config.spill_directory(),
            retry: RetryPolicy {
                retries: config.spill.io_retries,
                backoff: std::time::Duration::from_millis(config.spill.retry_backoff_ms),
            },
        }
    }
}

#[derive(Debug)]
struct Buffered {
    records: Vec<Record>,
    bytes: usize,
    spill: Option<SpillFile>,
    count: usize,
}

#[derive(Debug)]
enum ChannelState {
    Open(Buffered),
    Closed(Buffered),
    Consumed,
    Released,
}

impl ChannelState {
    fn name(&self) -> &'static str {
        match self {
            Self::Open(_) => "open",
            Self::Closed(_) => "closed",
            Self::Consumed => "consumed",
            Self::Released => "released",
        }
    }
}

/// Single-producer, single-consumer workset handoff for one superstep transition
#[derive(Debug)]
pub struct BackChannel {
    iteration_id: u32,
    partition: usize,
    superstep: u32,
    settings: BackChannelSettings,
    state: Mutex<ChannelState>,
    closed: Notify,
}

impl BackChannel {
    /// Channel carrying the workset produced by `superstep` into `superstep + 1`
    pub fn new(
        iteration_id: u32,
        partition: usize,
        superstep: u32,
        settings: BackChannelSettings,
    ) -> Self {
        Self {
            iteration_id,
            partition,
            superstep,
            settings,
            state: Mutex::new(ChannelState::Open(Buffered {
                records: Vec::new(),
                bytes: 0,
                spill: None,
                count: 0,
            })),
            closed: Notify::new(),
        }
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn superstep(&self) -> u32 {
        self.superstep
    }

    fn violation(&self, message: impl Into<String>) -> IterationError {
        IterationError::BackChannelProtocolViolation {
            iteration_id: self.iteration_id,
            partition: self.partition,
            superstep: self.superstep,
            message: message.into(),
        }
    }

    /// Append records. Fails once the channel is closed.
    pub fn write(&self, records: impl IntoIterator<Item = Record>) -> Result<usize> {
        let mut state = self.state.lock();
        let buffered = match &mut *state {
            ChannelState::Open(buffered) => buffered,
            other => return Err(self.violation(format!("write on {} channel", other.name()))),
        };

        let mut written = 0;
        for record in records {
            buffered.bytes += record.estimated_size();
            buffered.records.push(record);
            written += 1;
        }
        buffered.count += written;

        if buffered.bytes > self.settings.memory_budget_bytes {
            let spill = match buffered.spill.take() {
                Some(spill) => spill,
                None => SpillFile::create(
                    &self.settings.spill_directory,
                    &format!(
                        "back-channel-i{}-p{}-s{}-",
                        self.iteration_id, self.partition, self.superstep
                    ),
                    self.settings.retry,
                )?,
            };
            let spill = buffered.spill.insert(spill);
            for record in buffered.records.drain(..) {
                spill.append(&record)?;
            }
            buffered.bytes = 0;
            log_back_channel_operation(
                events::BACK_CHANNEL_SPILLED,
                self.iteration_id,
                self.partition,
                self.superstep,
                buffered.count,
                true,
            );
        }
        Ok(written)
    }

    /// Seal the channel and wake the reader. Returns the number of records written.
    pub fn close(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut *state, ChannelState::Consumed);
        let buffered = match previous {
            ChannelState::Open(buffered) => buffered,
            other => {
                let name = other.name();
                *state = other;
                return Err(self.violation(format!("close on {name} channel")));
            }
        };
        let count = buffered.count;
        let spilled = buffered.spill.is_some();
        *state = ChannelState::Closed(buffered);
        drop(state);

        log_back_channel_operation(
            events::BACK_CHANNEL_CLOSED,
            self.iteration_id,
            self.partition,
            self.superstep,
            count,
            spilled,
        );
        self.closed.notify_waiters();
        Ok(count)
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), ChannelState::Closed(_))
    }

    /// Wait until the producer has closed the channel, without consuming it
    pub async fn wait_closed(&self) -> Result<()> {
        loop {
            let notified = self.closed.notified();
            let open = {
                let state = self.state.lock();
                match &*state {
                    ChannelState::Closed(_) | ChannelState::Consumed => false,
                    ChannelState::Released => {
                        return Err(IterationError::ScopeAborted {
                            iteration_id: self.iteration_id,
                        })
                    }
                    ChannelState::Open(_) => true,
                }
            };
            if !open {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Non-blocking read: `None` while the producer has not closed the channel
    pub fn try_read(&self) -> Result<Option<Vec<Record>>> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, ChannelState::Consumed) {
            ChannelState::Closed(buffered) => {
                drop(state);
                Ok(Some(Self::drain(buffered)?))
            }
            ChannelState::Open(buffered) => {
                *state = ChannelState::Open(buffered);
                Ok(None)
            }
            ChannelState::Consumed => Err(self.violation("second read of consumed channel")),
            ChannelState::Released => {
                *state = ChannelState::Released;
                Err(IterationError::ScopeAborted {
                    iteration_id: self.iteration_id,
                })
            }
        }
    }

    /// Wait for the close, then take exactly the records written. A second read fails.
    pub async fn read(&self) -> Result<Vec<Record>> {
        loop {
            let notified = self.closed.notified();
            if let Some(records) = self.try_read()? {
                return Ok(records);
            }
            notified.await;
        }
    }

    /// Discard the contents and fail any waiting reader
    pub fn release(&self) {
        *self.state.lock() = ChannelState::Released;
        self.closed.notify_waiters();
    }

    fn drain(buffered: Buffered) -> Result<Vec<Record>> {
        let Buffered {
            records, spill, count, ..
        } = buffered;
        let mut out = Vec::with_capacity(count);
        if let Some(mut spill) = spill {
            out.extend(spill.read_all()?);
        }
        out.extend(records);
        Ok(out)
    }
}

/// Creates back-channels on demand and drops them once consumed or released
#[derive(Debug)]
pub struct BackChannelBroker {
    settings: BackChannelSettings,
    channels: DashMap<(u32, usize, u32), Arc<BackChannel>>,
}

impl BackChannelBroker {
    pub fn new(settings: BackChannelSettings) -> Self {
        Self {
            settings,
            channels: DashMap::new(),
        }
    }

    /// The channel carrying `partition`'s workset out of `superstep`
    pub fn channel(&self, iteration_id: u32, partition: usize, superstep: u32) -> Arc<BackChannel> {
        self.channels
            .entry((iteration_id, partition, superstep))
            .or_insert_with(|| {
                Arc::new(BackChannel::new(
                    iteration_id,
                    partition,
                    superstep,
                    self.settings.clone(),
                ))
            })
            .clone()
    }

    /// Read and unregister the channel for a transition
    pub async fn take(
        &self,
        iteration_id: u32,
        partition: usize,
        superstep: u32,
    ) -> Result<Vec<Record>> {
        let channel = self.channel(iteration_id, partition, superstep);
        let records = channel.read().await?;
        self.channels.remove(&(iteration_id, partition, superstep));
        Ok(records)
    }

    pub fn open_channels(&self, iteration_id: u32) -> usize {
        self.channels
            .iter()
            .filter(|entry| entry.key().0 == iteration_id)
            .count()
    }

    /// Release every channel of a scope, failing blocked readers
    pub fn release_scope(&self, iteration_id: u32) {
        self.channels.retain(|key, channel| {
            if key.0 == iteration_id {
                channel.release();
                false
            } else {
                true
            }
        });
    }
}
