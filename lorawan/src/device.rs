//! High-level LoRaWAN device interface
//!
//! This module provides the application-facing device. It owns the MAC
//! layer, turns interrupt events into outcomes and hands application
//! downlinks to a callback.

use crate::{
    config::{DeviceConfig, MacConfig, Session},
    lorawan::{
        mac::{Downlink, MacError, MacLayer, Response, State, Warning, MAX_WARNINGS},
        region::ChannelPlan,
    },
    radio::traits::Radio,
    storage::SessionStore,
    timer::{Clock, EventReceiver},
};

/// LoRaWAN device error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceError<E> {
    /// MAC layer error
    Mac(MacError<E>),
    /// Operation not possible with this device configuration
    InvalidConfig,
}

impl<E> From<MacError<E>> for DeviceError<E> {
    fn from(error: MacError<E>) -> Self {
        DeviceError::Mac(error)
    }
}

/// Class A LoRaWAN device
pub struct LoRaWANDevice<R: Radio, C: Clock, P: ChannelPlan, S: SessionStore> {
    mac: MacLayer<R, C, P, S>,
    otaa: bool,
    on_downlink: Option<fn(&Downlink)>,
}

impl<R: Radio, C: Clock, P: ChannelPlan, S: SessionStore> LoRaWANDevice<R, C, P, S> {
    /// Create the device and initialize the radio.
    ///
    /// A session held by `store` is resumed; an ABP configuration starts
    /// joined.
    pub fn new(
        radio: R,
        clock: C,
        plan: P,
        store: S,
        config: DeviceConfig,
        mac_config: MacConfig,
    ) -> Result<Self, DeviceError<R::Error>> {
        let otaa = config.abp_session().is_none();
        let mut mac = MacLayer::new(radio, clock, plan, store, config, mac_config);
        mac.init()?;
        Ok(Self {
            mac,
            otaa,
            on_downlink: None,
        })
    }

    /// Start the OTAA join procedure; the outcome arrives through `process`
    pub fn join(&mut self) -> Result<(), DeviceError<R::Error>> {
        if !self.otaa {
            return Err(DeviceError::InvalidConfig);
        }
        Ok(self.mac.join()?)
    }

    /// Send `payload` on `port`; returns the frame counter used
    pub fn send(&mut self, port: u8, payload: &[u8], confirmed: bool) -> Result<u32, DeviceError<R::Error>> {
        Ok(self.mac.send(port, payload, confirmed)?)
    }

    /// Register the callback receiving application downlinks
    pub fn on_downlink(&mut self, callback: fn(&Downlink)) {
        self.on_downlink = Some(callback);
    }

    /// Drain pending events and return the next outcome.
    ///
    /// Returns `WouldBlock` once the event queue is empty and nothing is
    /// left to report. Downlinks are passed to the registered callback
    /// before `DownlinkReceived` is returned; without a callback they stay
    /// available through [`take_downlink`](Self::take_downlink).
    pub fn process(&mut self, events: &mut EventReceiver<'_>) -> nb::Result<Response, DeviceError<R::Error>> {
        loop {
            if let Some(response) = self.mac.poll_response() {
                if let (Response::DownlinkReceived { .. }, Some(callback)) = (response, self.on_downlink) {
                    if let Some(downlink) = self.mac.take_downlink() {
                        callback(&downlink);
                    }
                }
                return Ok(response);
            }

            let event = events.next().ok_or(nb::Error::WouldBlock)?;
            self.mac
                .handle_event(event)
                .map_err(|e| nb::Error::Other(DeviceError::Mac(e)))?;
        }
    }

    /// Last application downlink not yet handed to a callback
    pub fn take_downlink(&mut self) -> Option<Downlink> {
        self.mac.take_downlink()
    }

    /// Cancel the operation in progress
    pub fn abort(&mut self) {
        self.mac.abort();
    }

    /// Forget the session
    pub fn reset(&mut self) -> Result<(), DeviceError<R::Error>> {
        Ok(self.mac.reset()?)
    }

    /// Piggy-back a LinkCheckReq on the next uplink
    pub fn request_link_check(&mut self) {
        self.mac.request_link_check();
    }

    /// Current MAC state
    pub fn state(&self) -> State {
        self.mac.state()
    }

    /// Whether a join or uplink is in progress
    pub fn is_busy(&self) -> bool {
        self.mac.is_busy()
    }

    /// Active session
    pub fn session(&self) -> Option<&Session> {
        self.mac.session()
    }

    /// Warnings raised since the last call
    pub fn take_warnings(&mut self) -> heapless::Vec<Warning, MAX_WARNINGS> {
        self.mac.take_warnings()
    }

    /// MAC layer
    pub fn mac(&self) -> &MacLayer<R, C, P, S> {
        &self.mac
    }
}
