//! A simulated SPI slave driver, for tests and the host simulator.
//!
//! [`SimBus`] keeps a transaction queue per host and plays the part of the
//! external master: [`SimBus::exchange`] clocks one exchange against the
//! head of the queue, the way a real peripheral would, and calls the hooks
//! from inside an [`Isr`] guard. It also records what it was asked to do,
//! and can be told to fail, so tests can check the driver contract.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    ptr::{self, NonNull},
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    bus::{Activation, HostId, PinRoles, SlaveBus, SpiMode, TransactionHooks, WaitPolicy},
    isr::Isr,
    transaction::Transaction,
};

#[derive(Default)]
pub struct SimBus {
    hosts: Mutex<BTreeMap<HostId, HostState>>,
}

/// What a channel asked for when it activated.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ActivationRecord {
    pub pins: PinRoles,
    pub mode: SpiMode,
    pub queue_depth: usize,
}

/// Snapshot of a descriptor at the moment it was submitted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Submission {
    pub length_bits: usize,
    pub trans_len_bits: usize,
    pub tag: usize,
    /// The transmit buffer, up to the declared length.
    pub tx: Vec<u8>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SimError {
    /// No channel has been activated on this host.
    NotActive(HostId),
    AlreadyActive(HostId),
    /// Activation was refused by request of [`SimBus::reject_activation`].
    Rejected(HostId),
    /// Submission was refused by request of [`SimBus::fail_next_submit`].
    SubmitFailed(HostId),
    QueueFull(HostId),
    /// The master clocked an exchange with no transaction queued.
    NothingQueued(HostId),
}

struct HostState {
    hooks: Option<&'static dyn TransactionHooks>,
    activation: Option<ActivationRecord>,
    queue: VecDeque<Queued>,
    submissions: Vec<Submission>,
    reject_activation: bool,
    fail_next_submit: bool,
}

struct Queued {
    trans: NonNull<Transaction>,
    announced: bool,
}

// SAFETY: a queued descriptor is only dereferenced by whoever is currently
// playing the hardware, and `SlaveBus::submit`'s contract keeps it alive
// until the after-transmission hook has run.
unsafe impl Send for Queued {}

impl SimBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn hosts(&self) -> MutexGuard<'_, BTreeMap<HostId, HostState>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next activation on `host` fail.
    pub fn reject_activation(&self, host: HostId) {
        self.hosts()
            .entry(host)
            .or_insert_with(HostState::new)
            .reject_activation = true;
    }

    /// Make the next submission on `host` fail.
    pub fn fail_next_submit(&self, host: HostId) {
        self.hosts()
            .entry(host)
            .or_insert_with(HostState::new)
            .fail_next_submit = true;
    }

    #[must_use]
    pub fn activation(&self, host: HostId) -> Option<ActivationRecord> {
        self.hosts().get(&host).and_then(|state| state.activation)
    }

    /// Every submission on `host`, oldest first.
    #[must_use]
    pub fn submissions(&self, host: HostId) -> Vec<Submission> {
        self.hosts()
            .get(&host)
            .map(|state| state.submissions.clone())
            .unwrap_or_default()
    }

    /// Number of transactions waiting on `host`.
    #[must_use]
    pub fn queued(&self, host: HostId) -> usize {
        self.hosts()
            .get(&host)
            .map_or(0, |state| state.queue.len())
    }

    /// The descriptor the master would exchange next on `host`.
    #[must_use]
    pub fn head(&self, host: HostId) -> Option<NonNull<Transaction>> {
        self.hosts()
            .get(&host)
            .and_then(|state| state.queue.front())
            .map(|queued| queued.trans)
    }

    /// Clock one exchange on `host`, with the master sending `mosi`.
    ///
    /// Returns what the slave sent back. If `mosi` is longer than the
    /// transaction, the excess is not exchanged (and not returned).
    pub fn exchange(&self, host: HostId, mosi: &[u8]) -> Result<Vec<u8>, SimError> {
        let (trans, hooks) = {
            let mut hosts = self.hosts();
            let state = hosts.get_mut(&host).ok_or(SimError::NotActive(host))?;
            let hooks = state.hooks.ok_or(SimError::NotActive(host))?;
            let queued = state
                .queue
                .pop_front()
                .ok_or(SimError::NothingQueued(host))?;
            (queued.trans, hooks)
        };

        // SAFETY: `submit`'s caller keeps the descriptor and its buffers alive
        // until after-transmission, which has not been called yet.
        let miso = unsafe {
            let t = &mut *trans.as_ptr();
            let n = mosi.len().min(t.max_len());
            ptr::copy_nonoverlapping(mosi.as_ptr(), t.rx_buffer(), n);
            let miso = std::slice::from_raw_parts(t.tx_buffer(), n).to_vec();
            t.set_trans_len_bits(mosi.len() * 8);
            miso
        };
        tracing::trace!(%host, sent = miso.len(), "exchange clocked");

        Isr::run(|| hooks.after_transmission(trans));

        // anything still waiting behind the finished transaction is now
        // loaded into the peripheral.
        let next = {
            let mut hosts = self.hosts();
            hosts
                .get_mut(&host)
                .and_then(|state| state.queue.front_mut())
                .filter(|queued| !queued.announced)
                .map(|queued| {
                    queued.announced = true;
                    queued.trans
                })
        };
        if let Some(next) = next {
            Isr::run(|| hooks.after_queueing(next));
        }

        Ok(miso)
    }
}

impl HostState {
    fn new() -> Self {
        Self {
            hooks: None,
            activation: None,
            queue: VecDeque::new(),
            submissions: Vec::new(),
            reject_activation: false,
            fail_next_submit: false,
        }
    }
}

impl SlaveBus for SimBus {
    type Error = SimError;

    fn activate(&self, activation: Activation<'_>) -> Result<(), SimError> {
        let host = activation.host;
        let mut hosts = self.hosts();
        let state = hosts.entry(host).or_insert_with(HostState::new);
        if core::mem::take(&mut state.reject_activation) {
            return Err(SimError::Rejected(host));
        }
        if state.hooks.is_some() {
            return Err(SimError::AlreadyActive(host));
        }
        state.hooks = Some(activation.hooks);
        state.activation = Some(ActivationRecord {
            pins: *activation.pins,
            mode: activation.mode,
            queue_depth: activation.queue_depth,
        });
        tracing::debug!(%host, ?activation, "activated");
        Ok(())
    }

    unsafe fn submit(
        &self,
        host: HostId,
        trans: NonNull<Transaction>,
        wait: WaitPolicy,
    ) -> Result<(), SimError> {
        let (hooks, announce) = {
            let mut hosts = self.hosts();
            let state = hosts.get_mut(&host).ok_or(SimError::NotActive(host))?;
            let (Some(hooks), Some(activation)) = (state.hooks, state.activation) else {
                return Err(SimError::NotActive(host));
            };
            if core::mem::take(&mut state.fail_next_submit) {
                return Err(SimError::SubmitFailed(host));
            }
            if state.queue.len() >= activation.queue_depth {
                // nothing else will ever drain the queue while we hold the
                // caller, so waiting forever would be a hang.
                tracing::warn!(%host, ?wait, "transaction queue full");
                return Err(SimError::QueueFull(host));
            }

            let t = trans.as_ref();
            state.submissions.push(Submission {
                length_bits: t.length_bits(),
                trans_len_bits: t.trans_len_bits(),
                tag: t.tag(),
                tx: std::slice::from_raw_parts(t.tx_buffer(), t.max_len()).to_vec(),
            });
            let announce = state.queue.is_empty();
            state.queue.push_back(Queued {
                trans,
                announced: announce,
            });
            (hooks, announce)
        };

        if announce {
            Isr::run(|| hooks.after_queueing(trans));
        }
        Ok(())
    }
}

impl fmt::Debug for SimBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hosts = self.hosts();
        f.debug_map()
            .entries(hosts.iter().map(|(host, state)| (host, state.queue.len())))
            .finish()
    }
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotActive(host) => write!(f, "{host} is not active"),
            Self::AlreadyActive(host) => write!(f, "{host} is already active"),
            Self::Rejected(host) => write!(f, "{host} refused activation"),
            Self::SubmitFailed(host) => write!(f, "{host} refused the transaction"),
            Self::QueueFull(host) => write!(f, "{host} transaction queue is full"),
            Self::NothingQueued(host) => write!(f, "{host} has no transaction queued"),
        }
    }
}

impl std::error::Error for SimError {}
