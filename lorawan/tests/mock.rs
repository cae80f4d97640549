#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use lorawan::config::device::{AESKey, DevAddr};
use lorawan::config::{DeviceConfig, MacConfig, Session};
use lorawan::crypto::Direction;
use lorawan::lorawan::frame::{self, CfList, DataFrame, DecodedFrame, FCtrl, JoinAccept, MType};
use lorawan::lorawan::mac::{MacError, MacLayer, Response};
use lorawan::lorawan::region::Au915;
use lorawan::radio::traits::{Radio, RadioEvent, RxConfig, TxConfig};
use lorawan::storage::{SessionStore, PERSISTED_SIZE};
use lorawan::timer::{Clock, Event, Tick, TimerToken, TICKS_PER_SECOND};

pub const DEV_EUI: [u8; 8] = [0x70, 0xB3, 0xD5, 0x7E, 0xD0, 0x05, 0x12, 0x34];
pub const APP_EUI: [u8; 8] = [0x00; 8];
pub const APP_KEY: AESKey = AESKey::new([
    0x2B, 0x7E, 0x15, 0x16, 0x28, 0xAE, 0xD2, 0xA6, 0xAB, 0xF7, 0x15, 0x88, 0x09, 0xCF, 0x4F, 0x3C,
]);
pub const NET_ADDR: DevAddr = DevAddr::from_u32(0x2601_1BDA);
pub const NWK_SKEY: AESKey = AESKey::new([0x11; 16]);
pub const APP_SKEY: AESKey = AESKey::new([0x22; 16]);

/// Mock radio error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockError {
    /// Transmission refused
    TxFailed,
}

/// Everything the MAC did to the radio
#[derive(Default)]
pub struct RadioState {
    pub transmitted: Vec<Vec<u8>>,
    pub tx_configs: Vec<TxConfig>,
    pub rx_configs: Vec<RxConfig>,
    pub receives: usize,
    pub standby: usize,
    pub asleep: bool,
    pub next: Option<RadioEvent>,
    pub frame: Vec<u8>,
    pub fail_transmit: bool,
}

/// Mock radio for testing; clones share state
#[derive(Clone, Default)]
pub struct MockRadio(pub Rc<RefCell<RadioState>>);

impl Radio for MockRadio {
    type Error = MockError;

    fn init(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn configure_tx(&mut self, config: TxConfig) -> Result<(), Self::Error> {
        self.0.borrow_mut().tx_configs.push(config);
        Ok(())
    }

    fn configure_rx(&mut self, config: RxConfig) -> Result<(), Self::Error> {
        self.0.borrow_mut().rx_configs.push(config);
        Ok(())
    }

    fn transmit(&mut self, buffer: &[u8]) -> Result<(), Self::Error> {
        let mut state = self.0.borrow_mut();
        if state.fail_transmit {
            return Err(MockError::TxFailed);
        }
        state.transmitted.push(buffer.to_vec());
        state.asleep = false;
        Ok(())
    }

    fn receive(&mut self) -> Result<(), Self::Error> {
        let mut state = self.0.borrow_mut();
        state.receives += 1;
        state.asleep = false;
        Ok(())
    }

    fn poll_event(&mut self, buffer: &mut [u8]) -> nb::Result<RadioEvent, Self::Error> {
        let mut state = self.0.borrow_mut();
        match state.next.take() {
            Some(RadioEvent::RxDone { len, rssi, snr }) => {
                buffer[..len].copy_from_slice(&state.frame[..len]);
                Ok(RadioEvent::RxDone { len, rssi, snr })
            }
            Some(event) => Ok(event),
            None => Err(nb::Error::WouldBlock),
        }
    }

    fn sleep(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().asleep = true;
        Ok(())
    }

    fn standby(&mut self) -> Result<(), Self::Error> {
        let mut state = self.0.borrow_mut();
        state.standby += 1;
        state.asleep = false;
        Ok(())
    }
}

/// Clock state: current tick and the armed alarm
#[derive(Default)]
pub struct ClockState {
    pub now: Tick,
    pub alarm: Option<(Tick, TimerToken)>,
}

/// Mock clock; clones share state
#[derive(Clone, Default)]
pub struct MockClock(pub Rc<RefCell<ClockState>>);

impl Clock for MockClock {
    fn now(&self) -> Tick {
        self.0.borrow().now
    }

    fn schedule_at(&mut self, at: Tick, token: TimerToken) {
        self.0.borrow_mut().alarm = Some((at, token));
    }

    fn cancel(&mut self) {
        self.0.borrow_mut().alarm = None;
    }
}

/// Session store backed by memory; clones share the record
#[derive(Clone, Default)]
pub struct MemoryStore(pub Rc<RefCell<Option<[u8; PERSISTED_SIZE]>>>);

impl MemoryStore {
    pub fn record(&self) -> Option<[u8; PERSISTED_SIZE]> {
        *self.0.borrow()
    }
}

impl SessionStore for MemoryStore {
    type Error = ();

    fn load(&mut self, buf: &mut [u8; PERSISTED_SIZE]) -> Result<bool, Self::Error> {
        match *self.0.borrow() {
            Some(record) => {
                *buf = record;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn save(&mut self, record: &[u8; PERSISTED_SIZE]) -> Result<(), Self::Error> {
        *self.0.borrow_mut() = Some(*record);
        Ok(())
    }
}

pub type TestMac = MacLayer<MockRadio, MockClock, Au915, MemoryStore>;
pub type TestResult = Result<(), MacError<MockError>>;

pub fn ms(ms: u32) -> u32 {
    (u64::from(ms) * u64::from(TICKS_PER_SECOND) / 1_000) as u32
}

/// MAC wired to mocks, with handles to drive and inspect them
pub struct Node {
    pub mac: TestMac,
    pub radio: MockRadio,
    pub clock: MockClock,
    pub store: MemoryStore,
}

impl Node {
    pub fn new(config: DeviceConfig, mac_config: MacConfig, store: MemoryStore) -> Self {
        let radio = MockRadio::default();
        let clock = MockClock::default();
        clock.0.borrow_mut().now = Tick(1_000);
        let mut mac = MacLayer::new(
            radio.clone(),
            clock.clone(),
            Au915::new(0x1234_5678),
            store.clone(),
            config,
            mac_config,
        );
        mac.init().unwrap();
        Self {
            mac,
            radio,
            clock,
            store,
        }
    }

    pub fn otaa() -> Self {
        Self::new(
            DeviceConfig::new_otaa(DEV_EUI, APP_EUI, APP_KEY),
            MacConfig::default(),
            MemoryStore::default(),
        )
    }

    pub fn abp() -> Self {
        Self::abp_with(MacConfig::default())
    }

    pub fn abp_with(mac_config: MacConfig) -> Self {
        Self::new(
            DeviceConfig::new_abp(NET_ADDR, NWK_SKEY, APP_SKEY),
            mac_config,
            MemoryStore::default(),
        )
    }

    pub fn now(&self) -> Tick {
        self.clock.0.borrow().now
    }

    pub fn advance(&self, ticks: u32) {
        let mut clock = self.clock.0.borrow_mut();
        clock.now = clock.now.wrapping_add(ticks);
    }

    pub fn alarm(&self) -> Option<(Tick, TimerToken)> {
        self.clock.0.borrow().alarm
    }

    fn radio_event(&mut self, event: RadioEvent) -> TestResult {
        self.radio.0.borrow_mut().next = Some(event);
        let at = self.now();
        self.mac.handle_event(Event::RadioIrq { at })
    }

    /// Radio reports the end of the transmission 50 ms later
    pub fn tx_done(&mut self) -> TestResult {
        self.advance(ms(50));
        self.radio_event(RadioEvent::TxDone)
    }

    /// Fire the armed alarm at its deadline
    pub fn fire(&mut self) -> TestResult {
        let (at, token) = self.clock.0.borrow_mut().alarm.take().expect("no alarm armed");
        {
            let mut clock = self.clock.0.borrow_mut();
            if clock.now.is_before(at) {
                clock.now = at;
            }
        }
        self.mac.handle_event(Event::Timer { token, at })
    }

    pub fn rx_timeout(&mut self) -> TestResult {
        self.advance(ms(20));
        self.radio_event(RadioEvent::RxTimeout)
    }

    pub fn rx_frame(&mut self, frame: &[u8]) -> TestResult {
        self.advance(ms(20));
        self.radio.0.borrow_mut().frame = frame.to_vec();
        self.radio_event(RadioEvent::RxDone {
            len: frame.len(),
            rssi: -80,
            snr: 7,
        })
    }

    /// TX done followed by two empty windows
    pub fn silent_cycle(&mut self) -> TestResult {
        self.tx_done()?;
        self.fire()?;
        self.rx_timeout()?;
        self.fire()?;
        self.rx_timeout()
    }

    /// TX done, then `frame` arrives in RX1
    pub fn rx1_cycle(&mut self, frame: &[u8]) -> TestResult {
        self.tx_done()?;
        self.fire()?;
        self.rx_frame(frame)
    }

    pub fn responses(&mut self) -> Vec<Response> {
        std::iter::from_fn(|| self.mac.poll_response()).collect()
    }

    /// Radio asleep and never put in standby
    pub fn radio_sleeping(&self) -> bool {
        let state = self.radio.0.borrow();
        state.asleep && state.standby == 0
    }

    pub fn transmissions(&self) -> usize {
        self.radio.0.borrow().transmitted.len()
    }

    pub fn last_uplink(&self) -> Vec<u8> {
        self.radio.0.borrow().transmitted.last().cloned().expect("nothing transmitted")
    }

    pub fn last_rx_config(&self) -> RxConfig {
        *self.radio.0.borrow().rx_configs.last().expect("no window opened")
    }

    pub fn session(&self) -> Session {
        self.mac.session().cloned().expect("not joined")
    }

    /// Decode the last uplink as the network server would
    pub fn decode_last_uplink(&self) -> DecodedFrame {
        let session = self.session();
        frame::decode_data(
            &self.last_uplink(),
            Direction::Up,
            session.dev_addr,
            &session.keys,
            None,
        )
        .expect("uplink does not decode")
    }

    /// Join with the accept arriving in RX1
    pub fn join(&mut self) {
        self.mac.join().unwrap();
        self.rx1_cycle(&join_accept(NET_ADDR, None)).unwrap();
        assert_eq!(self.responses(), vec![Response::JoinSuccess]);
    }
}

/// Join accept as the network server builds it
pub fn join_accept(dev_addr: DevAddr, cf_list: Option<CfList>) -> Vec<u8> {
    JoinAccept {
        app_nonce: [0x01, 0x02, 0x03],
        net_id: [0x13, 0x00, 0x00],
        dev_addr,
        rx1_dr_offset: 0,
        rx2_data_rate: 8,
        rx_delay: 1,
        cf_list,
    }
    .encode(&APP_KEY)
    .as_bytes()
    .to_vec()
}

/// Downlink description for [`downlink`]
#[derive(Default)]
pub struct Dl<'a> {
    pub fcnt: u32,
    pub ack: bool,
    pub confirmed: bool,
    pub f_opts: &'a [u8],
    pub port: Option<u8>,
    pub payload: &'a [u8],
}

/// Downlink for `session` as the network server builds it
pub fn downlink(session: &Session, dl: Dl<'_>) -> Vec<u8> {
    let mtype = if dl.confirmed {
        MType::ConfirmedDataDown
    } else {
        MType::UnconfirmedDataDown
    };
    DataFrame {
        mtype,
        f_ctrl: FCtrl {
            ack: dl.ack,
            ..FCtrl::default()
        },
        fcnt: dl.fcnt,
        f_opts: dl.f_opts,
        f_port: dl.port,
        payload: dl.payload,
    }
    .encode(session.dev_addr, &session.keys)
    .expect("downlink does not encode")
    .as_bytes()
    .to_vec()
}
