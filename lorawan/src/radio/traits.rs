/// Radio modulation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModulationParams {
    /// Spreading factor (SF7-SF12)
    pub spreading_factor: u8,
    /// Bandwidth in Hz
    pub bandwidth: u32,
    /// Coding rate denominator (5 = 4/5 ... 8 = 4/8)
    pub coding_rate: u8,
}

impl ModulationParams {
    /// LoRaWAN modulation with coding rate 4/5
    pub const fn lora(spreading_factor: u8, bandwidth: u32) -> Self {
        Self {
            spreading_factor,
            bandwidth,
            coding_rate: 5,
        }
    }

    /// Symbol duration in microseconds
    pub fn symbol_time_us(&self) -> u32 {
        ((1u64 << self.spreading_factor) * 1_000_000 / u64::from(self.bandwidth.max(1))) as u32
    }

    /// Whether low data rate optimisation is mandatory (symbols of 16 ms or longer)
    pub fn low_data_rate_optimize(&self) -> bool {
        self.symbol_time_us() >= 16_000
    }
}

/// Radio transmission parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxConfig {
    /// Transmission power in dBm
    pub power: i8,
    /// Frequency in Hz
    pub frequency: u32,
    /// Modulation parameters
    pub modulation: ModulationParams,
}

/// Radio receive parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxConfig {
    /// Frequency in Hz
    pub frequency: u32,
    /// Modulation parameters
    pub modulation: ModulationParams,
    /// Receive timeout in microseconds, measured from `receive()`
    pub timeout_us: u32,
    /// Preamble symbols to search for before giving up
    pub symbol_timeout: u16,
}

/// Completion reported by the radio after its interrupt line fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RadioEvent {
    /// Transmission finished
    TxDone,
    /// A frame of `len` bytes was copied into the caller's buffer
    RxDone {
        /// Frame length
        len: usize,
        /// Received signal strength in dBm
        rssi: i16,
        /// Signal to noise ratio in dB
        snr: i8,
    },
    /// Receive window closed without a frame
    RxTimeout,
    /// A frame was received with a bad PHY CRC
    CrcError,
}

/// Radio driver capability consumed by the MAC engine.
///
/// `transmit` and `receive` only start an operation. Completion is signalled
/// by the radio interrupt, after which the MAC calls `poll_event`.
pub trait Radio {
    /// Error type for radio operations
    type Error;

    /// Initialize the radio
    fn init(&mut self) -> Result<(), Self::Error>;

    /// Configure the radio for transmission
    fn configure_tx(&mut self, config: TxConfig) -> Result<(), Self::Error>;

    /// Configure the radio for reception
    fn configure_rx(&mut self, config: RxConfig) -> Result<(), Self::Error>;

    /// Start transmitting `buffer` with the last TX configuration
    fn transmit(&mut self, buffer: &[u8]) -> Result<(), Self::Error>;

    /// Open a single receive window with the last RX configuration
    fn receive(&mut self) -> Result<(), Self::Error>;

    /// Read the outcome of the running operation.
    ///
    /// Received frames are copied into `buffer`. Returns `WouldBlock` while
    /// the operation is still running.
    fn poll_event(&mut self, buffer: &mut [u8]) -> nb::Result<RadioEvent, Self::Error>;

    /// Put the radio into sleep mode
    fn sleep(&mut self) -> Result<(), Self::Error>;

    /// Put the radio into standby mode
    fn standby(&mut self) -> Result<(), Self::Error>;
}
