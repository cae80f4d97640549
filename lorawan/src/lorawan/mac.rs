//! MAC layer
//!
//! Class A state machine. The layer never blocks: it starts a radio
//! operation or arms the clock alarm and returns. [`MacLayer::handle_event`]
//! is fed the interrupt events in the order they happened and advances the
//! machine; outcomes are queued and collected with
//! [`MacLayer::poll_response`].
//!
//! ```text
//! Idle -> Joining -> JoinWaitRx1 -> JoinWaitRx2 -> Joined
//! Joined -> Transmitting -> WaitRx1 -> WaitRx2 -> Joined
//! ```

use heapless::spsc::Queue;
use heapless::Vec;

use super::commands::{self, CommandError, LinkAdrReq, MacCommand, MAX_EIRP_TABLE};
use super::frame::{
    self, CodecError, DataFrame, FCtrl, JoinAccept, JoinRequest, MType, MAX_FOPTS_LEN, MAX_FRAME_SIZE,
    MAX_PAYLOAD_SIZE,
};
use super::phy::{self, PhyConfig, PhyLayer, RxWindow};
use super::region::{AdrStatus, Channel, ChannelPlan, DataRate, PlanError};
use crate::config::{DeviceConfig, MacConfig, Session, SessionKeys};
use crate::crypto::{self, Direction};
use crate::radio::{Radio, RadioEvent};
use crate::storage::{PersistedSession, SessionStore, PERSISTED_SIZE};
use crate::timer::{Clock, Event, Tick, TimerToken};

/// Uplinks without downlink before ADRACKReq is set
pub const ADR_ACK_LIMIT: u32 = 64;

/// Further uplinks without downlink between two ADR back-off steps
pub const ADR_ACK_DELAY: u32 = 32;

/// Highest application port
pub const MAX_APP_PORT: u8 = 223;

/// FHDR without FOpts plus FPort
const FRAME_OVERHEAD: usize = 8;

/// MHDR, FHDR, FPort and MIC around an application payload
const PHY_OVERHEAD: usize = 13;

/// Warnings kept until `take_warnings`
pub const MAX_WARNINGS: usize = 8;

const RESPONSE_DEPTH: usize = 8;
const MAX_ANSWERS: usize = 8;
const MAX_ADR_BLOCK: usize = 16;

/// Observable MAC state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// No session, nothing in progress
    Idle,
    /// Join request being sent or waiting for the next attempt
    Joining,
    /// Waiting for the join accept in RX1
    JoinWaitRx1,
    /// Waiting for the join accept in RX2
    JoinWaitRx2,
    /// Session active, ready to send
    Joined,
    /// Uplink being sent or waiting for a free channel
    Transmitting,
    /// Waiting for a downlink in RX1
    WaitRx1,
    /// Waiting for a downlink in RX2
    WaitRx2,
}

/// Outcome reported to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Response {
    /// Join accept received, session established
    JoinSuccess,
    /// Unconfirmed uplink left the radio
    UplinkSent {
        /// Frame counter of the uplink
        fcnt: u32,
    },
    /// Confirmed uplink acknowledged by the network
    Acknowledged {
        /// Frame counter of the uplink
        fcnt: u32,
    },
    /// Application downlink available through `take_downlink`
    DownlinkReceived {
        /// Downlink frame counter
        fcnt: u32,
    },
    /// Answer to a LinkCheckReq
    LinkCheck {
        /// Link margin in dB
        margin: u8,
        /// Gateways that heard the request
        gateway_count: u8,
    },
    /// Receive windows of an unconfirmed uplink closed; ready to send
    RxComplete,
}

/// MAC layer error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MacError<E> {
    /// Radio driver error
    Radio(E),
    /// Session store failed
    Storage,
    /// Join attempts exhausted
    JoinFailed,
    /// Confirmed uplink not acknowledged after all retries
    ConfirmationFailed,
    /// Message integrity check failed
    InvalidMic,
    /// Frame counter replayed
    ReplayedCounter,
    /// No enabled channel can carry the current data rate
    NoChannelAvailable,
    /// LinkADRReq rejected
    InvalidAdrCommand,
    /// An operation is already in progress
    Busy,
    /// No session
    NotJoined,
    /// Port 0 or above 223
    InvalidPort,
    /// Payload exceeds the data rate or dwell-time limit
    PayloadTooLarge,
    /// Malformed frame
    InvalidFrame,
}

impl<E> From<CodecError> for MacError<E> {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::InvalidMic => MacError::InvalidMic,
            CodecError::ReplayedCounter => MacError::ReplayedCounter,
            CodecError::InvalidFrame | CodecError::AddressMismatch => MacError::InvalidFrame,
        }
    }
}

impl<E> From<PlanError> for MacError<E> {
    fn from(error: PlanError) -> Self {
        match error {
            PlanError::NoChannelAvailable => MacError::NoChannelAvailable,
            PlanError::InvalidAdrCommand(_) => MacError::InvalidAdrCommand,
        }
    }
}

/// Anomaly that did not stop the MAC, drained with `take_warnings`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Warning {
    /// A LinkADRReq block would have disabled every channel; nothing applied
    InvalidAdrCommand,
    /// Unknown or truncated MAC command; the rest of the block was skipped
    MalformedMacCommand(u8),
    /// MAC command the AU915 plan does not support
    UnsupportedMacCommand(u8),
}

/// Application data received in a downlink
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Downlink {
    /// Application port (1-223)
    pub port: u8,
    /// Decrypted payload
    pub payload: Vec<u8, MAX_PAYLOAD_SIZE>,
    /// Downlink frame counter
    pub fcnt: u32,
    /// Signal strength in dBm
    pub rssi: i16,
    /// Signal to noise ratio in dB
    pub snr: i8,
    /// Network asked for an acknowledgement
    pub confirmed: bool,
    /// Network has more data queued
    pub pending: bool,
}

/// Uplink owned by the MAC from `send` until its outcome
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PendingUplink {
    /// Application port
    pub port: u8,
    /// Clear-text payload
    pub payload: Vec<u8, MAX_PAYLOAD_SIZE>,
    /// Acknowledgement requested
    pub confirmed: bool,
    /// Frame counter reserved for every transmission of this uplink
    pub fcnt: u32,
    /// Retransmissions after a missing acknowledgement
    pub retries: u8,
    /// Transmissions started so far
    pub transmissions: u8,
    /// MAC answers carried in FOpts
    pub f_opts: Vec<u8, MAX_FOPTS_LEN>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    Rx1,
    Rx2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Idle,
    /// Alarm armed to start a transmission (back-off or deferral)
    Scheduled,
    AwaitTxDone,
    /// Alarm armed to open the window
    Pending(Window),
    Listening(Window),
}

/// One step of the ADR back-off ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backoff {
    MaxPower,
    DataRate(u8),
    AllChannels,
}

#[derive(Debug, Clone, Copy)]
struct LastTx {
    channel: Channel,
    data_rate: DataRate,
    end: Tick,
}

#[derive(Debug, Clone, Copy)]
struct ScheduledRx {
    frequency: u32,
    data_rate: DataRate,
    window: RxWindow,
}

fn codec_reason(error: CodecError) -> &'static str {
    match error {
        CodecError::InvalidMic => "bad MIC",
        CodecError::ReplayedCounter => "replayed counter",
        CodecError::InvalidFrame => "malformed",
        CodecError::AddressMismatch => "other device",
    }
}

/// MAC layer
pub struct MacLayer<R: Radio, C: Clock, P: ChannelPlan, S: SessionStore> {
    phy: PhyLayer<R>,
    clock: C,
    plan: P,
    store: S,
    device: DeviceConfig,
    config: MacConfig,
    state: State,
    step: Step,
    token: TimerToken,
    session: Option<Session>,
    dev_nonce: u16,
    join_nonce: u16,
    join_attempts: u8,
    pending: Option<PendingUplink>,
    last_tx: Option<LastTx>,
    rx: Option<ScheduledRx>,
    answers: Vec<MacCommand, MAX_ANSWERS>,
    sticky: Vec<MacCommand, MAX_ANSWERS>,
    link_check: bool,
    ack_downlink: bool,
    downlink: Option<Downlink>,
    responses: Queue<Response, RESPONSE_DEPTH>,
    warnings: Vec<Warning, MAX_WARNINGS>,
}

impl<R: Radio, C: Clock, P: ChannelPlan, S: SessionStore> MacLayer<R, C, P, S> {
    /// Create a new MAC layer
    pub fn new(radio: R, clock: C, plan: P, store: S, device: DeviceConfig, config: MacConfig) -> Self {
        Self {
            phy: PhyLayer::new(radio, PhyConfig::from(&config)),
            clock,
            plan,
            store,
            device,
            config,
            state: State::Idle,
            step: Step::Idle,
            token: TimerToken::default(),
            session: None,
            dev_nonce: config.dev_nonce,
            join_nonce: 0,
            join_attempts: 0,
            pending: None,
            last_tx: None,
            rx: None,
            answers: Vec::new(),
            sticky: Vec::new(),
            link_check: false,
            ack_downlink: false,
            downlink: None,
            responses: Queue::new(),
            warnings: Vec::new(),
        }
    }

    /// Initialize the radio and resume a stored or ABP session
    pub fn init(&mut self) -> Result<(), MacError<R::Error>> {
        self.phy.init().map_err(MacError::Radio)?;

        if let Some(sub_band) = self.config.sub_band {
            if self.plan.enable_sub_band(sub_band).is_err() {
                warn!("mac: sub-band {} invalid, all channels enabled", sub_band);
            }
        }

        let restored = self.load_session();
        if let Some(restored) = &restored {
            debug!("mac: next DevNonce {}", restored.dev_nonce);
            self.dev_nonce = restored.dev_nonce;
        }

        if let Some(PersistedSession {
            session: Some(session),
            channel_mask,
            ..
        }) = restored
        {
            if self.plan.set_channel_mask(channel_mask).is_err() {
                warn!("mac: stored channel mask empty, keeping defaults");
            }
            info!(
                "mac: session {} resumed at fcnt {}",
                session.dev_addr.to_u32(),
                session.fcnt_up
            );
            self.session = Some(session);
        } else if let Some((dev_addr, nwk_skey, app_skey)) = self.device.abp_session() {
            let (rx2_frequency, rx2_data_rate) = self.plan.rx2_default();
            let keys = SessionKeys { nwk_skey, app_skey };
            info!("mac: ABP session {}", dev_addr.to_u32());
            self.session = Some(Session::new(
                dev_addr,
                keys,
                rx2_frequency,
                rx2_data_rate,
                self.plan.default_data_rate(),
            ));
        }

        self.state = if self.session.is_some() { State::Joined } else { State::Idle };
        self.phy.sleep().map_err(MacError::Radio)
    }

    fn load_session(&mut self) -> Option<PersistedSession> {
        let mut record = [0u8; PERSISTED_SIZE];
        match self.store.load(&mut record) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(_) => {
                error!("mac: session store read failed");
                return None;
            }
        }
        let restored = PersistedSession::from_bytes(&record);
        if restored.is_none() {
            warn!("mac: stored session rejected");
        }
        restored
    }

    /// Write the session, or only the next DevNonce when there is none
    fn persist(&mut self) -> Result<(), MacError<R::Error>> {
        let record = PersistedSession {
            session: self.session.clone(),
            dev_nonce: self.dev_nonce,
            channel_mask: self.plan.channel_mask(),
        }
        .to_bytes();
        self.store.save(&record).map_err(|_| {
            error!("mac: session store write failed");
            MacError::Storage
        })
    }

    /// Current state
    pub fn state(&self) -> State {
        self.state
    }

    /// Active session
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Uplink in progress
    pub fn pending(&self) -> Option<&PendingUplink> {
        self.pending.as_ref()
    }

    /// DevNonce of the next join request
    pub fn dev_nonce(&self) -> u16 {
        self.dev_nonce
    }

    /// Channel plan
    pub fn plan(&self) -> &P {
        &self.plan
    }

    /// Whether a join or uplink is in progress
    pub fn is_busy(&self) -> bool {
        self.step != Step::Idle || self.pending.is_some()
    }

    fn is_joining(&self) -> bool {
        matches!(self.state, State::Joining | State::JoinWaitRx1 | State::JoinWaitRx2)
    }

    /// Start the OTAA join procedure.
    ///
    /// An existing session is discarded.
    pub fn join(&mut self) -> Result<(), MacError<R::Error>> {
        if self.is_busy() {
            return Err(MacError::Busy);
        }
        let rejoin = self.session.take().is_some();
        if rejoin {
            info!("mac: rejoin, session dropped");
        }
        self.join_attempts = 0;
        self.answers.clear();
        self.sticky.clear();
        self.state = State::Joining;
        let dropped = if rejoin { self.persist() } else { Ok(()) };
        let result = dropped.and_then(|()| self.transmit_join());
        self.guard(result)
    }

    /// Queue an uplink and start transmitting it.
    ///
    /// Returns the frame counter reserved for the uplink.
    pub fn send(&mut self, port: u8, payload: &[u8], confirmed: bool) -> Result<u32, MacError<R::Error>> {
        if self.is_busy() {
            return Err(MacError::Busy);
        }
        let current = self.session.as_ref().ok_or(MacError::NotJoined)?.data_rate;
        if port == 0 || port > MAX_APP_PORT {
            return Err(MacError::InvalidPort);
        }

        // Limits apply to the rate the frame leaves at, after any back-off step
        let backoff = self.adr_backoff();
        let data_rate = match backoff {
            Some(Backoff::DataRate(dr)) => dr,
            _ => current,
        };

        let max_payload = self.plan.max_payload(data_rate).ok_or(MacError::PayloadTooLarge)?;
        let room = max_payload.saturating_sub(FRAME_OVERHEAD);
        if payload.len() > room {
            return Err(MacError::PayloadTooLarge);
        }
        if let (Some(limit), Some(rate)) = (self.plan.max_airtime_us(), self.plan.data_rate(data_rate)) {
            if phy::time_on_air_us(&rate.modulation(), payload.len() + PHY_OVERHEAD) > limit {
                return Err(MacError::PayloadTooLarge);
            }
        }
        let payload: Vec<u8, MAX_PAYLOAD_SIZE> = Vec::from_slice(payload).map_err(|_| MacError::PayloadTooLarge)?;

        self.adr_tick(backoff);
        let f_opts = self.collect_f_opts(room - payload.len());
        let fcnt = match self.session.as_mut() {
            Some(session) => session.next_fcnt_up(),
            None => return Err(MacError::NotJoined),
        };

        self.pending = Some(PendingUplink {
            port,
            payload,
            confirmed,
            fcnt,
            retries: 0,
            transmissions: 0,
            f_opts,
        });
        self.state = State::Transmitting;

        let result = self.persist().and_then(|()| self.transmit_uplink());
        self.guard(result).map(|()| fcnt)
    }

    /// Ask the network for a link check with the next uplink
    pub fn request_link_check(&mut self) {
        self.link_check = true;
    }

    /// Cancel whatever is in progress and put the radio in standby
    pub fn abort(&mut self) {
        info!("mac: abort");
        self.abandon();
        if self.phy.standby().is_err() {
            error!("mac: radio standby failed");
        }
    }

    /// Forget the session; the store keeps only the next DevNonce
    pub fn reset(&mut self) -> Result<(), MacError<R::Error>> {
        self.abandon();
        self.session = None;
        self.state = State::Idle;
        self.join_attempts = 0;
        self.answers.clear();
        self.sticky.clear();
        self.link_check = false;
        self.ack_downlink = false;
        self.phy.sleep().map_err(MacError::Radio)?;
        self.persist()
    }

    /// Next queued outcome
    pub fn poll_response(&mut self) -> Option<Response> {
        self.responses.dequeue()
    }

    /// Application data of the last downlink
    pub fn take_downlink(&mut self) -> Option<Downlink> {
        self.downlink.take()
    }

    /// Warnings raised since the last call
    pub fn take_warnings(&mut self) -> Vec<Warning, MAX_WARNINGS> {
        core::mem::take(&mut self.warnings)
    }

    /// Advance the state machine with one interrupt event
    pub fn handle_event(&mut self, event: Event) -> Result<(), MacError<R::Error>> {
        let result = match event {
            Event::Timer { token, .. } if token != self.token => {
                trace!("mac: stale alarm {}", token.0);
                Ok(())
            }
            Event::Timer { .. } => self.on_alarm(),
            Event::RadioIrq { at } => self.on_radio_irq(at),
        };
        self.guard(result)
    }

    /// Drop the operation after an error and leave the radio asleep.
    ///
    /// `JoinFailed` and `ConfirmationFailed` are reported after `finish`,
    /// which already did both.
    fn guard<T>(&mut self, result: Result<T, MacError<R::Error>>) -> Result<T, MacError<R::Error>> {
        match &result {
            Ok(_) | Err(MacError::JoinFailed) | Err(MacError::ConfirmationFailed) => {}
            Err(_) => {
                self.abandon();
                if self.phy.sleep().is_err() {
                    error!("mac: radio sleep failed");
                }
            }
        }
        result
    }

    fn abandon(&mut self) {
        self.clock.cancel();
        self.token = self.token.next();
        self.pending = None;
        self.rx = None;
        self.step = Step::Idle;
        self.state = if self.session.is_some() { State::Joined } else { State::Idle };
    }

    fn arm(&mut self, at: Tick) {
        self.token = self.token.next();
        self.clock.schedule_at(at, self.token);
    }

    fn respond(&mut self, response: Response) {
        if self.responses.enqueue(response).is_err() {
            warn!("mac: response queue full");
        }
    }

    fn raise(&mut self, warning: Warning) {
        if self.warnings.push(warning).is_err() {
            debug!("mac: warning dropped");
        }
    }

    fn finish(&mut self) -> Result<(), MacError<R::Error>> {
        self.step = Step::Idle;
        self.rx = None;
        self.state = if self.session.is_some() { State::Joined } else { State::Idle };
        self.phy.sleep().map_err(MacError::Radio)
    }

    /// Wait for a channel to leave its dwell window instead of failing
    fn defer(&mut self, data_rate: u8) -> Result<(), MacError<R::Error>> {
        let now = self.clock.now();
        let wait = self
            .plan
            .time_until_available(data_rate, now)
            .ok_or(MacError::NoChannelAvailable)?;
        warn!("mac: all channels restricted, retry in {} ticks", wait);
        self.arm(now.wrapping_add(wait.max(1)));
        self.step = Step::Scheduled;
        Ok(())
    }

    fn transmit_join(&mut self) -> Result<(), MacError<R::Error>> {
        let now = self.clock.now();
        let (channel, data_rate) = match self.plan.select_join_channel(now) {
            Ok(choice) => choice,
            Err(_) => return self.defer(self.plan.default_data_rate()),
        };

        self.join_nonce = self.dev_nonce;
        self.dev_nonce = self.dev_nonce.wrapping_add(1);
        self.join_attempts = self.join_attempts.saturating_add(1);
        self.persist()?;

        let request = JoinRequest {
            app_eui: self.device.app_eui,
            dev_eui: self.device.dev_eui,
            dev_nonce: self.join_nonce,
        };
        let frame = request.encode(&self.device.app_key);
        info!(
            "mac: join attempt {} on ch{} DR{}",
            self.join_attempts, channel.index, data_rate.index
        );
        self.start_tx(channel, data_rate, frame.as_bytes(), 0)
    }

    fn transmit_uplink(&mut self) -> Result<(), MacError<R::Error>> {
        let (session, pending) = match (&self.session, &self.pending) {
            (Some(session), Some(pending)) => (session, pending),
            _ => return Err(MacError::NotJoined),
        };
        let dr = session.data_rate;
        let data_rate = self.plan.data_rate(dr).ok_or(MacError::NoChannelAvailable)?;

        let now = self.clock.now();
        let channel = match self.plan.select_uplink_channel(dr, now) {
            Ok(channel) => channel,
            Err(_) => return self.defer(dr),
        };

        let f_ctrl = FCtrl {
            adr: self.config.adr_enabled,
            adr_ack_req: self.config.adr_enabled && session.adr_ack_cnt > ADR_ACK_LIMIT,
            ack: self.ack_downlink,
            ..FCtrl::default()
        };
        let mtype = if pending.confirmed {
            MType::ConfirmedDataUp
        } else {
            MType::UnconfirmedDataUp
        };
        let frame = DataFrame {
            mtype,
            f_ctrl,
            fcnt: pending.fcnt,
            f_opts: &pending.f_opts,
            f_port: Some(pending.port),
            payload: &pending.payload,
        }
        .encode(session.dev_addr, &session.keys)?;
        let power = session.tx_power;

        debug!(
            "mac: uplink fcnt {} on ch{} DR{} ({} bytes)",
            pending.fcnt,
            channel.index,
            dr,
            frame.len()
        );
        self.ack_downlink = false;
        if let Some(pending) = self.pending.as_mut() {
            pending.transmissions = pending.transmissions.saturating_add(1);
        }
        self.start_tx(channel, data_rate, frame.as_bytes(), power)
    }

    fn start_tx(
        &mut self,
        channel: Channel,
        data_rate: DataRate,
        frame: &[u8],
        power_index: u8,
    ) -> Result<(), MacError<R::Error>> {
        let eirp = self
            .plan
            .tx_power_dbm(power_index)
            .or_else(|| self.plan.tx_power_dbm(0))
            .unwrap_or(self.phy.config.max_tx_power);
        let airtime = phy::time_on_air_us(&data_rate.modulation(), frame.len());

        self.phy
            .configure_tx(&channel, &data_rate, eirp)
            .map_err(MacError::Radio)?;
        self.phy.transmit(frame).map_err(MacError::Radio)?;

        let now = self.clock.now();
        self.plan.record_transmission(&channel, airtime, now);
        self.last_tx = Some(LastTx {
            channel,
            data_rate,
            end: now,
        });
        self.step = Step::AwaitTxDone;
        Ok(())
    }

    /// Back-off step due on the next uplink when the network has been
    /// silent for too long
    fn adr_backoff(&self) -> Option<Backoff> {
        if !self.config.adr_enabled {
            return None;
        }
        let session = self.session.as_ref()?;
        let count = session.adr_ack_cnt;
        if count < ADR_ACK_LIMIT + ADR_ACK_DELAY || (count - ADR_ACK_LIMIT) % ADR_ACK_DELAY != 0 {
            return None;
        }

        Some(if session.tx_power != 0 {
            Backoff::MaxPower
        } else if let Some(dr) = self.plan.lower_data_rate(session.data_rate) {
            Backoff::DataRate(dr)
        } else {
            Backoff::AllChannels
        })
    }

    /// Count an uplink for ADR and apply the back-off step computed for it
    fn adr_tick(&mut self, backoff: Option<Backoff>) {
        if !self.config.adr_enabled {
            return;
        }
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return,
        };
        session.adr_ack_cnt = session.adr_ack_cnt.saturating_add(1);

        match backoff {
            Some(Backoff::MaxPower) => {
                info!("mac: ADR back-off, max power");
                session.tx_power = 0;
            }
            Some(Backoff::DataRate(dr)) => {
                info!("mac: ADR back-off, DR{}", dr);
                session.data_rate = dr;
            }
            Some(Backoff::AllChannels) => {
                info!("mac: ADR back-off, all channels");
                self.plan.enable_all_channels();
            }
            None => {}
        }
    }

    /// Pack pending MAC answers into at most `room` bytes of FOpts
    fn collect_f_opts(&mut self, room: usize) -> Vec<u8, MAX_FOPTS_LEN> {
        let mut out = Vec::new();
        let link_check = self.link_check.then_some(MacCommand::LinkCheckReq);
        for command in self.sticky.iter().chain(self.answers.iter()).chain(link_check.iter()) {
            if out.len() + command.encoded_len() > room || command.encode(&mut out).is_err() {
                debug!("mac: FOpts full, CID {} dropped", command.cid() as u8);
            }
        }
        self.answers.clear();
        self.link_check = false;
        out
    }

    fn on_alarm(&mut self) -> Result<(), MacError<R::Error>> {
        match self.step {
            Step::Scheduled => {
                self.step = Step::Idle;
                if self.is_joining() {
                    self.transmit_join()
                } else {
                    self.transmit_uplink()
                }
            }
            Step::Pending(window) => self.open_window(window),
            _ => {
                trace!("mac: alarm ignored");
                Ok(())
            }
        }
    }

    fn on_radio_irq(&mut self, at: Tick) -> Result<(), MacError<R::Error>> {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let event = match self.phy.poll(&mut buf) {
            Ok(event) => event,
            Err(nb::Error::WouldBlock) => {
                trace!("mac: spurious radio interrupt");
                return Ok(());
            }
            Err(nb::Error::Other(e)) => return Err(MacError::Radio(e)),
        };

        match (self.step, event) {
            (Step::AwaitTxDone, RadioEvent::TxDone) => self.on_tx_done(at),
            (Step::Listening(window), RadioEvent::RxDone { len, rssi, snr }) => {
                let frame = &buf[..len.min(MAX_FRAME_SIZE)];
                if self.on_frame(frame, rssi, snr)? {
                    Ok(())
                } else {
                    self.window_closed(window)
                }
            }
            (Step::Listening(window), RadioEvent::RxTimeout | RadioEvent::CrcError) => {
                trace!("mac: window closed empty");
                self.window_closed(window)
            }
            _ => {
                debug!("mac: radio event ignored");
                Ok(())
            }
        }
    }

    fn on_tx_done(&mut self, at: Tick) -> Result<(), MacError<R::Error>> {
        if let Some(last) = self.last_tx.as_mut() {
            last.end = at;
        }
        if let Some(pending) = &self.pending {
            if !pending.confirmed && pending.transmissions == 1 {
                let fcnt = pending.fcnt;
                self.respond(Response::UplinkSent { fcnt });
            }
        }
        self.schedule_window(Window::Rx1)
    }

    /// Frequency, data rate and delay of `window` for the last transmission
    fn window_params(&self, window: Window) -> Option<(u32, DataRate, u32)> {
        let last = self.last_tx?;
        let timing = &self.phy.config.timing;

        let (frequency, dr, delay_s) = if self.is_joining() {
            match window {
                Window::Rx1 => (
                    self.plan.rx1_frequency(&last.channel),
                    self.plan.rx1_data_rate(last.data_rate.index, 0),
                    timing.join_accept_delay1,
                ),
                Window::Rx2 => {
                    let (frequency, dr) = self.plan.rx2_default();
                    (frequency, dr, timing.join_accept_delay2)
                }
            }
        } else {
            let session = self.session.as_ref()?;
            let rx1_delay = u32::from(session.rx1_delay.max(1));
            match window {
                Window::Rx1 => (
                    self.plan.rx1_frequency(&last.channel),
                    self.plan.rx1_data_rate(last.data_rate.index, session.rx1_dr_offset),
                    rx1_delay,
                ),
                Window::Rx2 => (session.rx2_frequency, session.rx2_data_rate, rx1_delay + 1),
            }
        };

        Some((frequency, self.plan.data_rate(dr)?, delay_s * 1_000))
    }

    fn schedule_window(&mut self, window: Window) -> Result<(), MacError<R::Error>> {
        self.phy.sleep().map_err(MacError::Radio)?;

        let (frequency, data_rate, delay_ms) = match (self.window_params(window), self.last_tx) {
            (Some(params), Some(_)) => params,
            _ => {
                warn!("mac: window parameters unusable, skipped");
                return self.window_closed(window);
            }
        };
        let end = self.last_tx.map_or(self.clock.now(), |last| last.end);
        let rx_window = phy::rx_window(&self.phy.config, end, delay_ms, &data_rate);

        self.rx = Some(ScheduledRx {
            frequency,
            data_rate,
            window: rx_window,
        });
        self.arm(rx_window.open_at);
        self.step = Step::Pending(window);
        self.state = match (self.is_joining(), window) {
            (true, Window::Rx1) => State::JoinWaitRx1,
            (true, Window::Rx2) => State::JoinWaitRx2,
            (false, Window::Rx1) => State::WaitRx1,
            (false, Window::Rx2) => State::WaitRx2,
        };
        Ok(())
    }

    fn open_window(&mut self, window: Window) -> Result<(), MacError<R::Error>> {
        let rx = match self.rx {
            Some(rx) => rx,
            None => return self.window_closed(window),
        };
        trace!(
            "mac: open window at {} Hz DR{} for {} us",
            rx.frequency,
            rx.data_rate.index,
            rx.window.timeout_us
        );
        self.phy
            .configure_rx(rx.frequency, &rx.data_rate, &rx.window)
            .map_err(MacError::Radio)?;
        self.phy.receive().map_err(MacError::Radio)?;
        self.step = Step::Listening(window);
        Ok(())
    }

    fn window_closed(&mut self, window: Window) -> Result<(), MacError<R::Error>> {
        match window {
            Window::Rx1 => self.schedule_window(Window::Rx2),
            Window::Rx2 if self.is_joining() => self.join_retry(),
            Window::Rx2 => self.uplink_done(false, false),
        }
    }

    fn join_retry(&mut self) -> Result<(), MacError<R::Error>> {
        if self.join_attempts >= self.config.max_join_attempts {
            warn!("mac: join failed after {} attempts", self.join_attempts);
            self.finish()?;
            return Err(MacError::JoinFailed);
        }
        let backoff_ms = self.config.join_backoff_for(self.join_attempts);
        debug!("mac: no join accept, next attempt in {} ms", backoff_ms);
        let at = self
            .clock
            .now()
            .wrapping_add(self.phy.config.tick_rate.ms_to_ticks(backoff_ms));
        self.arm(at);
        self.step = Step::Scheduled;
        self.state = State::Joining;
        self.phy.sleep().map_err(MacError::Radio)
    }

    /// Close the cycle of the pending uplink after its receive windows
    fn uplink_done(&mut self, downlink: bool, acked: bool) -> Result<(), MacError<R::Error>> {
        let mut pending = match self.pending.take() {
            Some(pending) => pending,
            None => return self.finish(),
        };
        let nb_trans = self.session.as_ref().map_or(1, |s| s.nb_trans);

        if pending.confirmed {
            if acked {
                self.finish()?;
                self.respond(Response::Acknowledged { fcnt: pending.fcnt });
                return Ok(());
            }
            if pending.retries >= self.config.max_retries {
                warn!(
                    "mac: fcnt {} unacknowledged after {} retries",
                    pending.fcnt, pending.retries
                );
                self.finish()?;
                return Err(MacError::ConfirmationFailed);
            }
            pending.retries += 1;
            debug!("mac: no ack for fcnt {}, retry {}", pending.fcnt, pending.retries);
        } else if downlink || pending.transmissions >= nb_trans {
            self.finish()?;
            self.respond(Response::RxComplete);
            return Ok(());
        }

        self.pending = Some(pending);
        self.state = State::Transmitting;
        self.step = Step::Idle;
        self.transmit_uplink()
    }

    /// Handle a received frame; `false` when it was discarded
    fn on_frame(&mut self, bytes: &[u8], rssi: i16, snr: i8) -> Result<bool, MacError<R::Error>> {
        if self.is_joining() {
            self.accept_join(bytes)
        } else {
            self.accept_downlink(bytes, rssi, snr)
        }
    }

    fn accept_join(&mut self, bytes: &[u8]) -> Result<bool, MacError<R::Error>> {
        let accept = match JoinAccept::decode(bytes, &self.device.app_key) {
            Ok(accept) => accept,
            Err(e) => {
                debug!("mac: join accept discarded ({})", codec_reason(e));
                return Ok(false);
            }
        };

        let keys = crypto::derive_session_keys(
            &self.device.app_key,
            &accept.app_nonce,
            &accept.net_id,
            self.join_nonce,
        );
        let (rx2_frequency, default_rx2_dr) = self.plan.rx2_default();
        let status = self
            .plan
            .validate_rx_params(accept.rx1_dr_offset, accept.rx2_data_rate, rx2_frequency);

        let mut session = Session::new(
            accept.dev_addr,
            keys,
            rx2_frequency,
            default_rx2_dr,
            self.plan.default_data_rate(),
        );
        session.net_id = accept.net_id_u32();
        session.rx1_delay = accept.rx_delay;
        if status.rx1_dr_offset_ack && status.rx2_data_rate_ack {
            session.rx1_dr_offset = accept.rx1_dr_offset;
            session.rx2_data_rate = accept.rx2_data_rate;
        } else {
            warn!("mac: join accept DLSettings out of range, defaults kept");
        }
        if let Some(cf_list) = &accept.cf_list {
            self.plan.apply_cf_list(cf_list);
        }

        info!(
            "mac: joined as {} (net {})",
            accept.dev_addr.to_u32(),
            session.net_id
        );
        self.session = Some(session);
        self.join_attempts = 0;
        self.finish()?;
        self.persist()?;
        self.respond(Response::JoinSuccess);
        Ok(true)
    }

    fn accept_downlink(&mut self, bytes: &[u8], rssi: i16, snr: i8) -> Result<bool, MacError<R::Error>> {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return Ok(false),
        };
        let decoded = match frame::decode_data(
            bytes,
            Direction::Down,
            session.dev_addr,
            &session.keys,
            session.fcnt_down,
        ) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("mac: downlink discarded ({})", codec_reason(e));
                return Ok(false);
            }
        };

        session.accept_fcnt_down(decoded.fcnt);
        session.adr_ack_cnt = 0;
        self.sticky.clear();

        let confirmed = decoded.mtype == MType::ConfirmedDataDown;
        if confirmed {
            self.ack_downlink = true;
        }
        debug!(
            "mac: downlink fcnt {} rssi {} snr {}",
            decoded.fcnt, rssi, snr
        );

        let mac_bytes = if decoded.f_port == Some(0) {
            &decoded.payload[..]
        } else {
            &decoded.fhdr.f_opts[..]
        };
        self.process_commands(mac_bytes, snr);

        if let Some(port) = decoded.f_port.filter(|port| *port != 0) {
            self.downlink = Some(Downlink {
                port,
                payload: decoded.payload,
                fcnt: decoded.fcnt,
                rssi,
                snr,
                confirmed,
                pending: decoded.fhdr.f_ctrl.f_pending,
            });
            self.respond(Response::DownlinkReceived { fcnt: decoded.fcnt });
        } else if decoded.fhdr.f_ctrl.f_pending {
            debug!("mac: network has more data queued");
        }

        self.persist()?;
        self.uplink_done(true, decoded.fhdr.f_ctrl.ack)?;
        Ok(true)
    }

    fn process_commands(&mut self, bytes: &[u8], snr: i8) {
        let mut adr_block: Vec<LinkAdrReq, MAX_ADR_BLOCK> = Vec::new();

        for item in commands::parse(Direction::Down, bytes) {
            let command = match item {
                Ok(command) => command,
                Err(CommandError::Unknown(cid)) | Err(CommandError::Truncated(cid)) => {
                    warn!("mac: malformed MAC command {}, rest skipped", cid);
                    self.raise(Warning::MalformedMacCommand(cid));
                    break;
                }
            };

            if let MacCommand::LinkADRReq(req) = command {
                if adr_block.push(req).is_err() {
                    warn!("mac: LinkADRReq block too long");
                }
                continue;
            }
            self.apply_adr_block(&mut adr_block);
            self.apply_command(command, snr);
        }
        self.apply_adr_block(&mut adr_block);
    }

    fn apply_adr_block(&mut self, block: &mut Vec<LinkAdrReq, MAX_ADR_BLOCK>) {
        if block.is_empty() {
            return;
        }

        let status = match self.plan.apply_adr(&block[..]) {
            Ok(outcome) => {
                if let (true, Some(session)) = (outcome.status.accepted(), self.session.as_mut()) {
                    if let Some(dr) = outcome.data_rate {
                        session.data_rate = dr;
                    }
                    if let Some(power) = outcome.tx_power {
                        session.tx_power = power;
                    }
                    if let Some(nb_trans) = outcome.nb_trans {
                        session.nb_trans = nb_trans;
                    }
                    debug!(
                        "mac: ADR DR{} power {} nb_trans {}",
                        session.data_rate, session.tx_power, session.nb_trans
                    );
                }
                outcome.status
            }
            Err(PlanError::InvalidAdrCommand(status)) => {
                self.raise(Warning::InvalidAdrCommand);
                status
            }
            Err(PlanError::NoChannelAvailable) => AdrStatus {
                power_ack: false,
                data_rate_ack: false,
                channel_mask_ack: false,
            },
        };

        for _ in 0..block.len() {
            self.answer(MacCommand::LinkADRAns(status));
        }
        block.clear();
    }

    fn answer(&mut self, command: MacCommand) {
        if self.answers.push(command).is_err() {
            debug!("mac: answer queue full");
        }
    }

    fn answer_sticky(&mut self, command: MacCommand) {
        if self.sticky.push(command).is_err() {
            debug!("mac: sticky answer queue full");
        }
    }

    fn apply_command(&mut self, command: MacCommand, snr: i8) {
        match command {
            MacCommand::LinkCheckAns {
                margin,
                gateway_count,
            } => {
                info!("mac: link margin {} dB via {} gateways", margin, gateway_count);
                self.respond(Response::LinkCheck {
                    margin,
                    gateway_count,
                });
            }
            MacCommand::DutyCycleReq { max_duty_cycle } => {
                debug!("mac: duty cycle limit 1/{}", 1u32 << (max_duty_cycle & 0x0F));
                self.answer(MacCommand::DutyCycleAns);
            }
            MacCommand::RXParamSetupReq {
                rx1_dr_offset,
                rx2_data_rate,
                frequency,
            } => {
                let status = self.plan.validate_rx_params(rx1_dr_offset, rx2_data_rate, frequency);
                let accepted = status.rx1_dr_offset_ack && status.rx2_data_rate_ack && status.channel_ack;
                if let (true, Some(session)) = (accepted, self.session.as_mut()) {
                    session.rx1_dr_offset = rx1_dr_offset;
                    session.rx2_data_rate = rx2_data_rate;
                    session.rx2_frequency = frequency;
                    debug!("mac: RX2 {} Hz DR{}", frequency, rx2_data_rate);
                }
                self.answer_sticky(MacCommand::RXParamSetupAns(status));
            }
            MacCommand::DevStatusReq => {
                let margin = snr.clamp(-32, 31);
                self.answer(MacCommand::DevStatusAns {
                    battery: self.config.battery_level,
                    margin,
                });
            }
            MacCommand::RXTimingSetupReq { delay } => {
                if let Some(session) = self.session.as_mut() {
                    session.rx1_delay = delay.max(1);
                    debug!("mac: RX1 delay {} s", session.rx1_delay);
                }
                self.answer_sticky(MacCommand::RXTimingSetupAns);
            }
            MacCommand::TxParamSetupReq {
                uplink_dwell_time,
                max_eirp,
                ..
            } => {
                let eirp = MAX_EIRP_TABLE[usize::from(max_eirp & 0x0F)];
                self.plan.set_tx_params(uplink_dwell_time, eirp);
                if let Some(session) = self.session.as_mut() {
                    // DR0/DR1 are unusable under dwell limits
                    while self.plan.max_payload(session.data_rate).is_none() && session.data_rate < 6 {
                        session.data_rate += 1;
                    }
                }
                debug!("mac: uplink dwell {} max EIRP {} dBm", uplink_dwell_time, eirp);
                self.answer(MacCommand::TxParamSetupAns);
            }
            MacCommand::NewChannelReq { .. } | MacCommand::DlChannelReq { .. } => {
                let cid = command.cid() as u8;
                warn!("mac: MAC command {} not supported in AU915", cid);
                self.raise(Warning::UnsupportedMacCommand(cid));
            }
            _ => {
                debug!("mac: unexpected MAC command {}", command.cid() as u8);
            }
        }
    }
}
