//! The agent: protocol orchestration between a local channel, the peer, and
//! the ledger collaborators.
//!
//! The agent is transport free. Local operations return the message to ship
//! to the peer; incoming messages go through [`Agent::handle_message`], which
//! returns the reply to ship back, if any. Observed ledger transactions are
//! fed through [`Agent::ingest`]. Callers serialize access, typically behind
//! a mutex shared with the receive loop.

use crate::collaborators::{BalanceCollector, SequenceNumberCollector, Snapshotter, Submitter};
use crate::error::AgentError;
use crate::msg::{Hello, Message};
use libsluice::agreement::CloseAgreement;
use libsluice::asset::Asset;
use libsluice::channel::{Channel, ChannelConfig, OpenParams};
use libsluice::envelope::{CloseEnvelope, CloseSignatures, OpenEnvelope, OpenSignatures};
use libsluice::error::ChannelError;
use libsluice::ingest::{ChannelEvent, StreamedTx};
use libsluice::keys::{Address, Signer};
use libsluice::snapshot::Snapshot;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Sender;
use std::time::Duration;

/// Static configuration of an agent.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub observation_period_time: Duration,
    pub observation_period_ledger_gap: i64,
    pub max_open_expiry: Duration,
    pub network_id: String,
    pub channel_account: Address,
    pub signer: Signer,
}

/// Notifications pushed to the application as the agent makes progress.
#[derive(Clone, Debug)]
pub enum AgentEvent {
    Connected { channel_account: Address, signer: Address },
    Opened,
    PaymentReceived(CloseAgreement),
    PaymentSent(CloseAgreement),
    DeclarationObserved { iteration: i64 },
    Closed { iteration: i64 },
}

/// Everything the agent needs to resume after a restart, except what the
/// caller re-supplies through [`AgentConfig`] and the collaborators.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub remote_channel_account: Option<Address>,
    pub remote_signer: Option<Address>,
    pub cursor: Option<i64>,
    pub channel: Option<ChannelRecord>,
}

/// A channel's snapshot plus the role it was created with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub initiator: bool,
    pub snapshot: Snapshot,
}

pub struct Agent {
    config: AgentConfig,
    balance_collector: Box<dyn BalanceCollector + Send>,
    sequence_number_collector: Box<dyn SequenceNumberCollector + Send>,
    submitter: Box<dyn Submitter + Send>,
    snapshotter: Option<Box<dyn Snapshotter + Send>>,
    events: Option<Sender<AgentEvent>>,

    remote_channel_account: Option<Address>,
    remote_signer: Option<Address>,
    cursor: Option<i64>,
    channel: Option<Channel>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        balance_collector: Box<dyn BalanceCollector + Send>,
        sequence_number_collector: Box<dyn SequenceNumberCollector + Send>,
        submitter: Box<dyn Submitter + Send>,
    ) -> Agent {
        Agent {
            config,
            balance_collector,
            sequence_number_collector,
            submitter,
            snapshotter: None,
            events: None,
            remote_channel_account: None,
            remote_signer: None,
            cursor: None,
            channel: None,
        }
    }

    /// Persist a snapshot through `snapshotter` after every meaningful state
    /// change.
    pub fn with_snapshotter(mut self, snapshotter: Box<dyn Snapshotter + Send>) -> Self {
        self.snapshotter = Some(snapshotter);
        self
    }

    /// Push [`AgentEvent`]s to `events` as the agent makes progress.
    pub fn with_events(mut self, events: Sender<AgentEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Resume from a snapshot taken by a previous agent with the same
    /// configuration.
    pub fn restore(mut self, snapshot: AgentSnapshot) -> Result<Self, AgentError> {
        self.remote_channel_account = snapshot.remote_channel_account;
        self.remote_signer = snapshot.remote_signer;
        self.cursor = snapshot.cursor;
        if let Some(record) = snapshot.channel {
            let config = self.channel_config(record.initiator)?;
            self.channel = Some(Channel::from_snapshot(config, record.snapshot)?);
        }
        Ok(self)
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn channel_mut(&mut self) -> Option<&mut Channel> {
        self.channel.as_mut()
    }

    /// The ingestion cursor to resume streaming from.
    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            remote_channel_account: self.remote_channel_account,
            remote_signer: self.remote_signer,
            cursor: self.cursor,
            channel: self
                .channel
                .as_ref()
                .map(|c| ChannelRecord { initiator: c.is_initiator(), snapshot: c.snapshot() }),
        }
    }

    fn take_snapshot(&mut self) {
        let snapshot = self.snapshot();
        if let Some(snapshotter) = &mut self.snapshotter {
            if let Err(e) = snapshotter.snapshot(&snapshot) {
                warn!("failed to persist snapshot: {e}");
            }
        }
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn channel_config(&self, initiator: bool) -> Result<ChannelConfig, AgentError> {
        let remote_channel_account = self.remote_channel_account.ok_or(AgentError::NotConnected)?;
        let remote_signer = self.remote_signer.ok_or(AgentError::NotConnected)?;
        Ok(ChannelConfig {
            network_id: self.config.network_id.clone(),
            max_open_expiry: self.config.max_open_expiry,
            initiator,
            local_channel_account: self.config.channel_account,
            remote_channel_account,
            local_signer: self.config.signer.clone(),
            remote_signer,
        })
    }

    //------------------------------------   Local operations   --------------------------------------------//

    /// The handshake message identifying this participant. Sent first on any
    /// new connection.
    pub fn hello(&self) -> Message {
        Message::Hello(Hello {
            channel_account: self.config.channel_account,
            signer: self.config.signer.address(),
        })
    }

    /// Kick off the open exchange. Returns the request to send to the peer.
    pub fn open(
        &mut self,
        asset: Asset,
        local_contribution: i64,
        remote_contribution: i64,
    ) -> Result<Message, AgentError> {
        if self.channel.is_some() {
            return Err(AgentError::ChannelExists);
        }
        let config = self.channel_config(true)?;
        let sequence = self.sequence_number_collector.get_sequence_number(&self.config.channel_account)?;
        let mut channel = Channel::new(config);
        // Expire the proposal at half the window so clock drift between the
        // participants cannot push it past the peer's limit.
        let expires_at = std::time::SystemTime::now() + self.config.max_open_expiry / 2;
        let envelope = channel.propose_open(OpenParams {
            observation_period_time: self.config.observation_period_time,
            observation_period_ledger_gap: self.config.observation_period_ledger_gap,
            asset,
            expires_at,
            starting_sequence: sequence + 1,
            initiator_contribution: local_contribution,
            responder_contribution: remote_contribution,
        })?;
        self.channel = Some(channel);
        self.take_snapshot();
        Ok(Message::OpenRequest(envelope))
    }

    /// Propose a payment to the peer. Equivalent to
    /// [`Agent::payment_with_memo`] with no memo.
    pub fn payment(&mut self, amount: i64) -> Result<Message, AgentError> {
        self.payment_with_memo(amount, None)
    }

    /// Propose a payment to the peer. The payment is not authorized until
    /// the peer's response has been handled. If the proposal looks
    /// underfunded on cached balances, the local channel account balance is
    /// refreshed once and the proposal retried.
    pub fn payment_with_memo(&mut self, amount: i64, memo: Option<Vec<u8>>) -> Result<Message, AgentError> {
        let channel = self.channel.as_mut().ok_or(AgentError::NoChannel)?;
        let envelope = match channel.propose_payment_with_memo(amount, memo.clone()) {
            Err(ChannelError::Underfunded) => {
                info!("local looks underfunded on cached balances, refreshing from the ledger");
                let asset = channel.open_agreement()?.details().asset.clone();
                let account = channel.local_channel_account();
                let balance = self.balance_collector.get_balance(&account, &asset)?;
                channel.update_local_channel_account_balance(balance);
                channel.propose_payment_with_memo(amount, memo)?
            }
            other => other?,
        };
        self.take_snapshot();
        Ok(Message::PaymentRequest(envelope))
    }

    /// Begin an uncooperative close: submit the latest declaration, then
    /// propose a revised agreement the peer can countersign for an immediate
    /// close. Returns the proposal to send.
    pub fn declare_close(&mut self) -> Result<Message, AgentError> {
        let channel = self.channel.as_mut().ok_or(AgentError::NoChannel)?;
        let (declaration, _) = channel.close_txs()?;
        debug!("submitting declaration for iteration {}", channel.latest_authorized_close_agreement()?.iteration_number());
        self.submitter.submit_tx(&declaration)?;
        let envelope = channel.propose_close()?;
        self.take_snapshot();
        Ok(Message::CloseRequest(envelope))
    }

    /// Submit the close transaction of the latest authorized agreement.
    /// Valid once its observation period has passed, or immediately after a
    /// cooperative close is authorized.
    pub fn submit_close(&mut self) -> Result<(), AgentError> {
        let channel = self.channel.as_ref().ok_or(AgentError::NoChannel)?;
        let (_, close) = channel.close_txs()?;
        self.submitter.submit_tx(&close)?;
        Ok(())
    }

    //------------------------------------   Incoming messages   -------------------------------------------//

    /// Handle one message from the peer, returning the reply to send back,
    /// if any.
    pub fn handle_message(&mut self, message: Message) -> Result<Option<Message>, AgentError> {
        debug!("handling {message}");
        match message {
            Message::Hello(hello) => self.handle_hello(hello).map(|_| None),
            Message::OpenRequest(envelope) => self.handle_open_request(envelope).map(Some),
            Message::OpenResponse(signatures) => self.handle_open_response(signatures).map(|_| None),
            Message::PaymentRequest(envelope) => self.handle_payment_request(envelope).map(Some),
            Message::PaymentResponse(signatures) => self.handle_payment_response(signatures).map(|_| None),
            Message::CloseRequest(envelope) => self.handle_close_request(envelope).map(Some),
            Message::CloseResponse(signatures) => self.handle_close_response(signatures).map(|_| None),
        }
    }

    fn handle_hello(&mut self, hello: Hello) -> Result<(), AgentError> {
        if let Some(known) = self.remote_channel_account {
            if known != hello.channel_account {
                return Err(AgentError::UnexpectedHello {
                    field: "channel account",
                    expected: known.to_string(),
                    actual: hello.channel_account.to_string(),
                });
            }
        }
        if let Some(known) = self.remote_signer {
            if known != hello.signer {
                return Err(AgentError::UnexpectedHello {
                    field: "signer",
                    expected: known.to_string(),
                    actual: hello.signer.to_string(),
                });
            }
        }
        self.remote_channel_account = Some(hello.channel_account);
        self.remote_signer = Some(hello.signer);
        info!("peer channel account: {}", hello.channel_account);
        self.emit(AgentEvent::Connected { channel_account: hello.channel_account, signer: hello.signer });
        self.take_snapshot();
        Ok(())
    }

    fn handle_open_request(&mut self, envelope: OpenEnvelope) -> Result<Message, AgentError> {
        if self.channel.is_some() {
            return Err(AgentError::ChannelExists);
        }
        let config = self.channel_config(false)?;
        let mut channel = Channel::new(config);
        let confirmed = channel.confirm_open(envelope)?;
        self.channel = Some(channel);
        self.take_snapshot();
        info!("open authorized");
        Ok(Message::OpenResponse(confirmed.confirmer_signatures))
    }

    fn handle_open_response(&mut self, signatures: OpenSignatures) -> Result<(), AgentError> {
        let channel = self.channel.as_mut().ok_or(AgentError::NoChannel)?;
        let mut envelope = channel.proposed_open_envelope().cloned().ok_or(ChannelError::NoUnauthorizedAgreement)?;
        envelope.confirmer_signatures = signatures;
        channel.confirm_open(envelope)?;
        info!("open authorized, submitting formation");
        let formation = channel.open_tx()?;
        self.submitter.submit_tx(&formation)?;
        self.take_snapshot();
        Ok(())
    }

    fn handle_payment_request(&mut self, envelope: CloseEnvelope) -> Result<Message, AgentError> {
        let channel = self.channel.as_mut().ok_or(AgentError::NoChannel)?;
        let confirmed = match channel.confirm_payment(envelope.clone()) {
            Err(ChannelError::Underfunded) => {
                info!("peer looks underfunded on cached balances, refreshing from the ledger");
                let asset = channel.open_agreement()?.details().asset.clone();
                let account = channel.remote_channel_account();
                let balance = self.balance_collector.get_balance(&account, &asset)?;
                channel.update_remote_channel_account_balance(balance);
                channel.confirm_payment(envelope)?
            }
            other => other?,
        };
        let agreement = channel.latest_authorized_close_agreement()?.clone();
        self.take_snapshot();
        info!("payment authorized at iteration {}", agreement.iteration_number());
        self.emit(AgentEvent::PaymentReceived(agreement));
        Ok(Message::PaymentResponse(confirmed.confirmer_signatures))
    }

    fn handle_payment_response(&mut self, signatures: CloseSignatures) -> Result<(), AgentError> {
        let channel = self.channel.as_mut().ok_or(AgentError::NoChannel)?;
        let agreement = channel.finalize_payment(signatures)?;
        self.take_snapshot();
        info!("payment authorized at iteration {}", agreement.iteration_number());
        self.emit(AgentEvent::PaymentSent(agreement));
        Ok(())
    }

    fn handle_close_request(&mut self, envelope: CloseEnvelope) -> Result<Message, AgentError> {
        let channel = self.channel.as_mut().ok_or(AgentError::NoChannel)?;
        let confirmed = channel.confirm_close(envelope)?;
        // The revised close carries no observation period; submit right away.
        let (_, close) = channel.close_txs()?;
        self.take_snapshot();
        info!("close authorized, submitting close");
        self.submitter.submit_tx(&close)?;
        Ok(Message::CloseResponse(confirmed.confirmer_signatures))
    }

    fn handle_close_response(&mut self, signatures: CloseSignatures) -> Result<(), AgentError> {
        let channel = self.channel.as_mut().ok_or(AgentError::NoChannel)?;
        channel.finalize_close(signatures)?;
        let (_, close) = channel.close_txs()?;
        self.take_snapshot();
        info!("close authorized, submitting close");
        self.submitter.submit_tx(&close)?;
        Ok(())
    }

    //------------------------------------   Ingestion   ---------------------------------------------------//

    /// Feed one streamed ledger transaction to the channel and advance the
    /// streaming cursor.
    pub fn ingest(&mut self, streamed: &StreamedTx) -> Result<(), AgentError> {
        self.cursor = Some(streamed.order_id);
        let Some(channel) = self.channel.as_mut() else {
            return Ok(());
        };
        let event = channel.ingest_tx(streamed)?;
        if let Some(event) = event {
            info!("observed {event}");
            match event {
                ChannelEvent::OpenExecuted { .. } => self.emit(AgentEvent::Opened),
                ChannelEvent::DeclarationExecuted { iteration, .. } => {
                    self.emit(AgentEvent::DeclarationObserved { iteration })
                }
                ChannelEvent::CloseExecuted { iteration, .. } => self.emit(AgentEvent::Closed { iteration }),
            }
            self.take_snapshot();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Streamer;
    use libsluice::balance::ChannelBalances;
    use libsluice::tx::Tx;
    use std::sync::mpsc::{channel as mpsc_channel, Receiver};
    use std::sync::{Arc, Mutex};

    const NETWORK: &str = "sluice test network ; september 2025";

    struct StaticBalance(i64);

    impl BalanceCollector for StaticBalance {
        fn get_balance(&self, _account: &Address, _asset: &Asset) -> Result<i64, anyhow::Error> {
            Ok(self.0)
        }
    }

    struct StaticSequence(i64);

    impl SequenceNumberCollector for StaticSequence {
        fn get_sequence_number(&self, _account: &Address) -> Result<i64, anyhow::Error> {
            Ok(self.0)
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSubmitter(Arc<Mutex<Vec<Tx>>>);

    impl Submitter for RecordingSubmitter {
        fn submit_tx(&self, tx: &Tx) -> Result<(), anyhow::Error> {
            self.0.lock().unwrap().push(tx.clone());
            Ok(())
        }
    }

    impl RecordingSubmitter {
        fn submitted(&self) -> Vec<Tx> {
            self.0.lock().unwrap().clone()
        }
    }

    #[derive(Clone, Default)]
    struct MemoryStore(Arc<Mutex<Option<AgentSnapshot>>>);

    impl Snapshotter for MemoryStore {
        fn snapshot(&mut self, snapshot: &AgentSnapshot) -> Result<(), anyhow::Error> {
            *self.0.lock().unwrap() = Some(snapshot.clone());
            Ok(())
        }
    }

    struct ReplayStreamer(Vec<StreamedTx>);

    impl Streamer for ReplayStreamer {
        fn stream_tx(
            &self,
            cursor: Option<i64>,
            _accounts: &[Address],
        ) -> (Receiver<StreamedTx>, Box<dyn FnOnce() + Send>) {
            let (sender, receiver) = mpsc_channel();
            for tx in &self.0 {
                if cursor.map_or(true, |c| tx.order_id > c) {
                    sender.send(tx.clone()).unwrap();
                }
            }
            (receiver, Box::new(move || drop(sender)))
        }
    }

    fn agent(initiator: bool, submitter: RecordingSubmitter, balance: i64) -> Agent {
        let (signer_seed, account_seed) = if initiator { (1u8, 11u8) } else { (2u8, 12u8) };
        let config = AgentConfig {
            observation_period_time: Duration::from_secs(20),
            observation_period_ledger_gap: 4,
            max_open_expiry: Duration::from_secs(3600),
            network_id: NETWORK.into(),
            channel_account: Signer::from_seed(&[account_seed; 32]).address(),
            signer: Signer::from_seed(&[signer_seed; 32]),
        };
        Agent::new(config, Box::new(StaticBalance(balance)), Box::new(StaticSequence(99)), Box::new(submitter))
    }

    /// Exchange hellos and run the open exchange to authorization.
    fn connected_open_pair(
        initiator_submitter: RecordingSubmitter,
        responder_submitter: RecordingSubmitter,
    ) -> (Agent, Agent) {
        let mut initiator = agent(true, initiator_submitter, 1000);
        let mut responder = agent(false, responder_submitter, 1000);
        assert!(responder.handle_message(initiator.hello()).unwrap().is_none());
        assert!(initiator.handle_message(responder.hello()).unwrap().is_none());
        let open_request = initiator.open(Asset::Native, 1000, 1000).unwrap();
        let open_response = responder.handle_message(open_request).unwrap().unwrap();
        assert!(initiator.handle_message(open_response).unwrap().is_none());
        (initiator, responder)
    }

    #[test]
    fn full_session() {
        env_logger::try_init().ok();
        let initiator_submitter = RecordingSubmitter::default();
        let responder_submitter = RecordingSubmitter::default();
        let (mut initiator, mut responder) =
            connected_open_pair(initiator_submitter.clone(), responder_submitter.clone());

        // The initiator submitted the formation on open authorization.
        let submitted = initiator_submitter.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].sequence_number(), 100);

        let payment_request = initiator.payment(300).unwrap();
        let payment_response = responder.handle_message(payment_request).unwrap().unwrap();
        assert!(initiator.handle_message(payment_response).unwrap().is_none());
        let balances = initiator.channel().unwrap().balances().unwrap();
        assert_eq!(balances, ChannelBalances::new(700, 1300));
        assert_eq!(responder.channel().unwrap().balances().unwrap(), balances);

        // Cooperative close: declaration, then both sides submit the close.
        let close_request = initiator.declare_close().unwrap();
        let close_response = responder.handle_message(close_request).unwrap().unwrap();
        assert!(initiator.handle_message(close_response).unwrap().is_none());
        let submitted = initiator_submitter.submitted();
        assert_eq!(submitted.len(), 3); // formation, declaration, close
        let close = submitted.last().unwrap();
        assert_eq!(close.preconditions().min_sequence_age, Duration::ZERO);
        assert_eq!(responder_submitter.submitted().len(), 1); // close only
    }

    #[test]
    fn underfunded_payment_refreshes_and_retries() {
        let (mut initiator, _) = connected_open_pair(RecordingSubmitter::default(), RecordingSubmitter::default());
        // Stale cache: the channel believes the account is empty, the ledger
        // (the static collector) says 1000.
        initiator.channel_mut().unwrap().update_local_channel_account_balance(0);
        let message = initiator.payment(600).unwrap();
        assert!(matches!(message, Message::PaymentRequest(_)));
        assert_eq!(initiator.channel().unwrap().local_channel_account_balance(), Some(1000));
    }

    #[test]
    fn hello_with_a_different_identity_is_rejected() {
        let mut initiator = agent(true, RecordingSubmitter::default(), 1000);
        let mut responder = agent(false, RecordingSubmitter::default(), 1000);
        initiator.handle_message(responder.hello()).unwrap();
        let imposter = agent(true, RecordingSubmitter::default(), 1000);
        let err = initiator.handle_message(imposter.hello()).unwrap_err();
        assert!(matches!(err, AgentError::UnexpectedHello { .. }));
    }

    #[test]
    fn operations_require_a_channel() {
        let mut lone = agent(true, RecordingSubmitter::default(), 1000);
        assert!(matches!(lone.payment(1).unwrap_err(), AgentError::NoChannel));
        assert!(matches!(lone.declare_close().unwrap_err(), AgentError::NoChannel));
        // Opening requires the hello exchange first.
        assert!(matches!(lone.open(Asset::Native, 1, 1).unwrap_err(), AgentError::NotConnected));
    }

    #[test]
    fn snapshots_capture_and_restore_the_session() {
        let store = MemoryStore::default();
        let initiator_submitter = RecordingSubmitter::default();
        let mut initiator = agent(true, initiator_submitter.clone(), 1000).with_snapshotter(Box::new(store.clone()));
        let mut responder = agent(false, RecordingSubmitter::default(), 1000);
        responder.handle_message(initiator.hello()).unwrap();
        initiator.handle_message(responder.hello()).unwrap();
        let open_request = initiator.open(Asset::Native, 1000, 1000).unwrap();
        let open_response = responder.handle_message(open_request).unwrap().unwrap();
        initiator.handle_message(open_response).unwrap();
        let payment_request = initiator.payment(300).unwrap();
        let payment_response = responder.handle_message(payment_request).unwrap().unwrap();
        initiator.handle_message(payment_response).unwrap();

        let snapshot = store.0.lock().unwrap().clone().unwrap();
        let restored = agent(true, initiator_submitter, 1000).restore(snapshot).unwrap();
        let channel = restored.channel().unwrap();
        assert!(channel.is_initiator());
        assert_eq!(channel.balances().unwrap(), ChannelBalances::new(700, 1300));
    }

    #[test]
    fn streamed_transactions_reach_the_channel() {
        let initiator_submitter = RecordingSubmitter::default();
        let (events_sender, events) = mpsc_channel();
        let (mut initiator, _) = connected_open_pair(initiator_submitter.clone(), RecordingSubmitter::default());
        initiator = initiator.with_events(events_sender);

        let formation = initiator_submitter.submitted().remove(0);
        let streamer = ReplayStreamer(vec![StreamedTx { order_id: 1, tx: formation, success: true }]);
        let (receiver, cancel) = streamer.stream_tx(initiator.cursor(), &[initiator.config.channel_account]);
        for streamed in receiver.try_iter() {
            initiator.ingest(&streamed).unwrap();
        }
        cancel();

        assert_eq!(initiator.cursor(), Some(1));
        assert!(initiator.channel().unwrap().open_executed_with().is_some());
        let observed: Vec<AgentEvent> = events.try_iter().collect();
        assert!(observed.iter().any(|e| matches!(e, AgentEvent::Opened)));
    }
}
