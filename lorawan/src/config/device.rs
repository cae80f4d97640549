/// EUI-64 (8 bytes, transmitted little-endian)
pub type EUI64 = [u8; 8];

/// AES-128 key (16 bytes)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AESKey([u8; 16]);

impl AESKey {
    /// Wrap raw key material
    pub const fn new(key: [u8; 16]) -> Self {
        Self(key)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

// Keys never end up in logs.
impl core::fmt::Debug for AESKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("AESKey(..)")
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for AESKey {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "AESKey(..)")
    }
}

/// Device address, stored in wire (little-endian) byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DevAddr([u8; 4]);

impl DevAddr {
    /// Create from wire-order bytes
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Create from the numeric address as shown by network servers
    pub const fn from_u32(addr: u32) -> Self {
        Self(addr.to_le_bytes())
    }

    /// Numeric address
    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Wire-order bytes
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

/// Device identity and root key material.
///
/// OTAA devices carry only the EUIs and the AppKey; the session is created by
/// the join procedure. ABP devices bring a ready-made session.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Device EUI (unique device identifier)
    pub dev_eui: EUI64,
    /// Application EUI (JoinEUI)
    pub app_eui: EUI64,
    /// Application root key used for the join exchange
    pub app_key: AESKey,
    /// Device address, ABP only
    pub dev_addr: Option<DevAddr>,
    /// Network session key, ABP only
    pub nwk_skey: Option<AESKey>,
    /// Application session key, ABP only
    pub app_skey: Option<AESKey>,
}

impl DeviceConfig {
    /// Create a new OTAA device configuration
    pub fn new_otaa(dev_eui: EUI64, app_eui: EUI64, app_key: AESKey) -> Self {
        Self {
            dev_eui,
            app_eui,
            app_key,
            dev_addr: None,
            nwk_skey: None,
            app_skey: None,
        }
    }

    /// Create a new ABP device configuration
    pub fn new_abp(dev_addr: DevAddr, nwk_skey: AESKey, app_skey: AESKey) -> Self {
        Self {
            dev_eui: [0; 8],
            app_eui: [0; 8],
            app_key: AESKey::new([0; 16]),
            dev_addr: Some(dev_addr),
            nwk_skey: Some(nwk_skey),
            app_skey: Some(app_skey),
        }
    }

    /// ABP session material, if this configuration carries it
    pub fn abp_session(&self) -> Option<(DevAddr, AESKey, AESKey)> {
        match (self.dev_addr, self.nwk_skey, self.app_skey) {
            (Some(addr), Some(nwk), Some(app)) => Some((addr, nwk, app)),
            _ => None,
        }
    }
}

/// Session keys derived by the join procedure (or provisioned for ABP)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SessionKeys {
    /// Network session key: MIC computation and FPort 0 payloads
    pub nwk_skey: AESKey,
    /// Application session key: application payload encryption
    pub app_skey: AESKey,
}

/// Active session of a joined device.
///
/// Only the MAC layer mutates a session; the application gets read access.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Session {
    /// Device address assigned by the network
    pub dev_addr: DevAddr,
    /// Session keys
    pub keys: SessionKeys,
    /// Network identifier from the join accept
    pub net_id: u32,
    /// Counter for the next uplink
    pub fcnt_up: u32,
    /// Last accepted downlink counter, `None` until the first downlink
    pub fcnt_down: Option<u32>,
    /// RX1 delay in seconds (RX2 opens one second later)
    pub rx1_delay: u8,
    /// RX1 data rate offset
    pub rx1_dr_offset: u8,
    /// RX2 frequency in Hz
    pub rx2_frequency: u32,
    /// RX2 data rate index
    pub rx2_data_rate: u8,
    /// Current uplink data rate index
    pub data_rate: u8,
    /// Current TX power index (0 = max EIRP)
    pub tx_power: u8,
    /// Transmissions per unconfirmed uplink
    pub nb_trans: u8,
    /// Uplinks sent since the last downlink
    pub adr_ack_cnt: u32,
}

impl Session {
    /// Create a session with regional defaults for the receive windows
    pub fn new(
        dev_addr: DevAddr,
        keys: SessionKeys,
        rx2_frequency: u32,
        rx2_data_rate: u8,
        data_rate: u8,
    ) -> Self {
        Self {
            dev_addr,
            keys,
            net_id: 0,
            fcnt_up: 0,
            fcnt_down: None,
            rx1_delay: 1,
            rx1_dr_offset: 0,
            rx2_frequency,
            rx2_data_rate,
            data_rate,
            tx_power: 0,
            nb_trans: 1,
            adr_ack_cnt: 0,
        }
    }

    /// Reserve the counter for a new uplink and advance to the next one
    pub fn next_fcnt_up(&mut self) -> u32 {
        let fcnt = self.fcnt_up;
        self.fcnt_up = self.fcnt_up.wrapping_add(1);
        fcnt
    }

    /// Record an accepted downlink counter
    pub fn accept_fcnt_down(&mut self, fcnt: u32) {
        self.fcnt_down = Some(fcnt);
    }
}
