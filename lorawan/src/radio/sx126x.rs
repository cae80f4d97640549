//! Semtech SX1261/SX1262 driver
//!
//! Command-level SPI driver for LoRa operation. Operations are started from
//! the MAC task and complete through the DIO1 interrupt; the driver never
//! waits for a transmission or reception to finish.

use embedded_hal::{
    blocking::delay::DelayMs,
    blocking::spi::{Transfer, Write},
    digital::v2::{InputPin, OutputPin},
};

use crate::radio::traits::{ModulationParams, Radio, RadioEvent, RxConfig, TxConfig};

mod registers {
    pub const REG_IQ_POLARITY_SETUP: u16 = 0x0736;
    pub const REG_LORA_SYNC_WORD_MSB: u16 = 0x0740;
    pub const REG_OCP: u16 = 0x08E7;
}

mod commands {
    pub const GET_STATUS: u8 = 0xC0;
    pub const SET_SLEEP: u8 = 0x84;
    pub const SET_STANDBY: u8 = 0x80;
    pub const SET_TX: u8 = 0x83;
    pub const SET_RX: u8 = 0x82;
    pub const STOP_TIMER_ON_PREAMBLE: u8 = 0x9F;
    pub const SET_LORA_SYMB_NUM_TIMEOUT: u8 = 0xA0;
    pub const SET_REGULATOR_MODE: u8 = 0x96;
    pub const CALIBRATE: u8 = 0x89;
    pub const CALIBRATE_IMAGE: u8 = 0x98;
    pub const SET_PA_CONFIG: u8 = 0x95;
    pub const WRITE_REGISTER: u8 = 0x0D;
    pub const READ_REGISTER: u8 = 0x1D;
    pub const WRITE_BUFFER: u8 = 0x0E;
    pub const READ_BUFFER: u8 = 0x1E;
    pub const SET_BUFFER_BASE_ADDRESS: u8 = 0x8F;
    pub const SET_DIO_IRQ_PARAMS: u8 = 0x08;
    pub const GET_IRQ_STATUS: u8 = 0x12;
    pub const CLR_IRQ_STATUS: u8 = 0x02;
    pub const GET_RX_BUFFER_STATUS: u8 = 0x13;
    pub const SET_DIO2_AS_RF_SWITCH_CTRL: u8 = 0x9D;
    pub const SET_DIO3_AS_TCXO_CTRL: u8 = 0x97;
    pub const SET_RF_FREQUENCY: u8 = 0x86;
    pub const SET_PKT_TYPE: u8 = 0x8A;
    pub const SET_TX_PARAMS: u8 = 0x8E;
    pub const SET_MODULATION_PARAMS: u8 = 0x8B;
    pub const SET_PKT_PARAMS: u8 = 0x8C;
    pub const GET_PKT_STATUS: u8 = 0x14;
}

mod irq {
    pub const TX_DONE: u16 = 0x0001;
    pub const RX_DONE: u16 = 0x0002;
    pub const HEADER_ERR: u16 = 0x0020;
    pub const CRC_ERR: u16 = 0x0040;
    pub const TIMEOUT: u16 = 0x0200;
    pub const ALL: u16 = 0xFFFF;
    pub const LORAWAN: u16 = TX_DONE | RX_DONE | HEADER_ERR | CRC_ERR | TIMEOUT;
}

/// Crystal frequency the PLL is derived from
const XTAL_FREQ: u64 = 32_000_000;

/// Length of one RTC step used by chip timeouts and delays, in nanoseconds
const RTC_STEP_NS: u64 = 15_625;

/// LoRaWAN preamble length
const PREAMBLE_LEN: u16 = 8;

/// Polls of the BUSY line before a command is declared stuck
const BUSY_POLLS: u32 = 10_000;

/// SX126x driver error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RadioError {
    /// SPI transfer error
    Spi,
    /// GPIO error
    Gpio,
    /// Invalid configuration
    Config,
    /// Operation started before the radio was configured for it
    NotConfigured,
    /// BUSY line stuck high
    Timeout,
}

/// TCXO supply voltage driven on DIO3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TcxoVoltage {
    /// 1.6 V
    V1_6 = 0x00,
    /// 1.7 V
    V1_7 = 0x01,
    /// 1.8 V
    V1_8 = 0x02,
    /// 2.2 V
    V2_2 = 0x03,
    /// 2.4 V
    V2_4 = 0x04,
    /// 2.7 V
    V2_7 = 0x05,
    /// 3.0 V
    V3_0 = 0x06,
    /// 3.3 V
    V3_3 = 0x07,
}

/// Board wiring of the transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sx126xConfig {
    /// TCXO controlled by DIO3, `None` for a plain crystal
    pub tcxo: Option<TcxoVoltage>,
    /// TCXO start-up time in microseconds
    pub tcxo_startup_us: u32,
    /// DIO2 drives the RF switch
    pub dio2_rf_switch: bool,
    /// Use the DC-DC regulator instead of the LDO
    pub use_dcdc: bool,
}

impl Default for Sx126xConfig {
    fn default() -> Self {
        Self {
            tcxo: Some(TcxoVoltage::V1_8),
            tcxo_startup_us: 5_000,
            dio2_rf_switch: true,
            use_dcdc: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Sleep,
    Standby,
    Tx,
    Rx,
}

/// SX1262 transceiver
pub struct SX126x<SPI, CS, RESET, BUSY, DIO1, DELAY>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    RESET: OutputPin,
    BUSY: InputPin,
    DIO1: InputPin,
    DELAY: DelayMs<u32>,
{
    spi: SPI,
    cs: CS,
    reset: RESET,
    busy: BUSY,
    dio1: DIO1,
    delay: DELAY,
    config: Sx126xConfig,
    mode: Mode,
    tx_config: Option<TxConfig>,
    rx_config: Option<RxConfig>,
}

impl<SPI, CS, RESET, BUSY, DIO1, DELAY> SX126x<SPI, CS, RESET, BUSY, DIO1, DELAY>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    RESET: OutputPin,
    BUSY: InputPin,
    DIO1: InputPin,
    DELAY: DelayMs<u32>,
{
    /// Create new SX126x driver instance and reset the chip
    ///
    /// # Arguments
    /// * `spi` - SPI interface
    /// * `cs` - Chip select pin
    /// * `reset` - Reset pin
    /// * `busy` - Busy pin
    /// * `dio1` - DIO1 interrupt pin
    /// * `delay` - Delay implementation
    /// * `config` - Board wiring
    pub fn new(
        spi: SPI,
        cs: CS,
        reset: RESET,
        busy: BUSY,
        dio1: DIO1,
        delay: DELAY,
        config: Sx126xConfig,
    ) -> Result<Self, RadioError> {
        let mut radio = Self {
            spi,
            cs,
            reset,
            busy,
            dio1,
            delay,
            config,
            mode: Mode::Standby,
            tx_config: None,
            rx_config: None,
        };

        radio.cs.set_high().map_err(|_| RadioError::Gpio)?;
        radio.reset.set_low().map_err(|_| RadioError::Gpio)?;
        radio.delay.delay_ms(1);
        radio.reset.set_high().map_err(|_| RadioError::Gpio)?;
        radio.delay.delay_ms(10);
        radio.wait_busy()?;

        Ok(radio)
    }

    fn wait_busy(&mut self) -> Result<(), RadioError> {
        for _ in 0..BUSY_POLLS {
            if self.busy.is_low().map_err(|_| RadioError::Gpio)? {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(RadioError::Timeout)
    }

    /// Wake the chip if it sleeps, then wait until it accepts a command.
    ///
    /// BUSY stays high during sleep; only a falling edge on NSS wakes the
    /// chip, so the first access after `sleep` must not poll BUSY first.
    fn ready(&mut self) -> Result<(), RadioError> {
        if self.mode == Mode::Sleep {
            self.cs.set_low().map_err(|_| RadioError::Gpio)?;
            let result = self.spi.write(&[commands::GET_STATUS, 0x00]);
            self.cs.set_high().map_err(|_| RadioError::Gpio)?;
            result.map_err(|_| RadioError::Spi)?;
            self.mode = Mode::Standby;
        }
        self.wait_busy()
    }

    fn write_command(&mut self, command: u8, data: &[u8]) -> Result<(), RadioError> {
        self.ready()?;
        self.cs.set_low().map_err(|_| RadioError::Gpio)?;
        let result = self
            .spi
            .write(&[command])
            .and_then(|_| if data.is_empty() { Ok(()) } else { self.spi.write(data) });
        self.cs.set_high().map_err(|_| RadioError::Gpio)?;
        result.map_err(|_| RadioError::Spi)
    }

    /// Issue a read command: opcode, `params`, one status byte, then `out`
    fn read_command(&mut self, command: u8, params: &[u8], out: &mut [u8]) -> Result<(), RadioError> {
        self.ready()?;
        self.cs.set_low().map_err(|_| RadioError::Gpio)?;
        let header = self
            .spi
            .write(&[command])
            .and_then(|_| if params.is_empty() { Ok(()) } else { self.spi.write(params) })
            .and_then(|_| self.spi.write(&[0x00]))
            .map_err(|_| RadioError::Spi);
        let result = header.and_then(|_| {
            out.iter_mut().for_each(|b| *b = 0);
            self.spi.transfer(out).map(|_| ()).map_err(|_| RadioError::Spi)
        });
        self.cs.set_high().map_err(|_| RadioError::Gpio)?;
        result
    }

    fn write_register(&mut self, address: u16, data: &[u8]) -> Result<(), RadioError> {
        let [hi, lo] = address.to_be_bytes();
        self.ready()?;
        self.cs.set_low().map_err(|_| RadioError::Gpio)?;
        let result = self
            .spi
            .write(&[commands::WRITE_REGISTER, hi, lo])
            .and_then(|_| self.spi.write(data));
        self.cs.set_high().map_err(|_| RadioError::Gpio)?;
        result.map_err(|_| RadioError::Spi)
    }

    fn read_register(&mut self, address: u16, data: &mut [u8]) -> Result<(), RadioError> {
        self.read_command(commands::READ_REGISTER, &address.to_be_bytes(), data)
    }

    fn set_frequency(&mut self, frequency: u32) -> Result<(), RadioError> {
        self.write_command(commands::SET_RF_FREQUENCY, &pll_steps(frequency).to_be_bytes())
    }

    fn set_modulation(&mut self, modulation: &ModulationParams) -> Result<(), RadioError> {
        if !(5..=12).contains(&modulation.spreading_factor) {
            return Err(RadioError::Config);
        }
        let bw = bandwidth_code(modulation.bandwidth).ok_or(RadioError::Config)?;
        let cr = modulation.coding_rate.clamp(5, 8) - 4;
        let ldro = u8::from(modulation.low_data_rate_optimize());
        self.write_command(
            commands::SET_MODULATION_PARAMS,
            &[modulation.spreading_factor, bw, cr, ldro],
        )
    }

    fn set_packet_params(&mut self, payload_len: u8, crc_on: bool, iq_inverted: bool) -> Result<(), RadioError> {
        let [pre_hi, pre_lo] = PREAMBLE_LEN.to_be_bytes();
        self.write_command(
            commands::SET_PKT_PARAMS,
            &[pre_hi, pre_lo, 0x00, payload_len, u8::from(crc_on), u8::from(iq_inverted)],
        )?;

        // Chip errata 15.4: the IQ polarity register must match the packet setting.
        let mut reg = [0u8];
        self.read_register(registers::REG_IQ_POLARITY_SETUP, &mut reg)?;
        let value = if iq_inverted { reg[0] & !0x04 } else { reg[0] | 0x04 };
        self.write_register(registers::REG_IQ_POLARITY_SETUP, &[value])
    }

    fn set_tx_power(&mut self, power: i8) -> Result<(), RadioError> {
        let power = power.clamp(-9, 22);
        // High-power PA table entry for +22 dBm on the SX1262.
        self.write_command(commands::SET_PA_CONFIG, &[0x04, 0x07, 0x00, 0x01])?;
        self.write_register(registers::REG_OCP, &[0x38])?;
        // Ramp time 200 us.
        self.write_command(commands::SET_TX_PARAMS, &[power as u8, 0x04])
    }

    fn irq_status(&mut self) -> Result<u16, RadioError> {
        let mut status = [0u8; 2];
        self.read_command(commands::GET_IRQ_STATUS, &[], &mut status)?;
        Ok(u16::from_be_bytes(status))
    }

    fn clear_irq(&mut self, mask: u16) -> Result<(), RadioError> {
        self.write_command(commands::CLR_IRQ_STATUS, &mask.to_be_bytes())
    }

    fn read_frame(&mut self, buffer: &mut [u8]) -> Result<(usize, i16, i8), RadioError> {
        let mut status = [0u8; 2];
        self.read_command(commands::GET_RX_BUFFER_STATUS, &[], &mut status)?;
        let len = usize::from(status[0]);
        let offset = status[1];
        if len > buffer.len() {
            return Err(RadioError::Config);
        }
        self.read_command(commands::READ_BUFFER, &[offset], &mut buffer[..len])?;

        let mut pkt = [0u8; 3];
        self.read_command(commands::GET_PKT_STATUS, &[], &mut pkt)?;
        let rssi = -(i16::from(pkt[0]) / 2);
        let snr = (pkt[1] as i8) / 4;
        Ok((len, rssi, snr))
    }
}

impl<SPI, CS, RESET, BUSY, DIO1, DELAY> Radio for SX126x<SPI, CS, RESET, BUSY, DIO1, DELAY>
where
    SPI: Transfer<u8> + Write<u8>,
    CS: OutputPin,
    RESET: OutputPin,
    BUSY: InputPin,
    DIO1: InputPin,
    DELAY: DelayMs<u32>,
{
    type Error = RadioError;

    fn init(&mut self) -> Result<(), Self::Error> {
        self.write_command(commands::SET_STANDBY, &[0x00])?;

        if let Some(voltage) = self.config.tcxo {
            let steps = rtc_steps(self.config.tcxo_startup_us).to_be_bytes();
            self.write_command(
                commands::SET_DIO3_AS_TCXO_CTRL,
                &[voltage as u8, steps[1], steps[2], steps[3]],
            )?;
        }

        self.write_command(commands::CALIBRATE, &[0x7F])?;
        self.delay.delay_ms(5);
        // 902-928 MHz image calibration.
        self.write_command(commands::CALIBRATE_IMAGE, &[0xE1, 0xE9])?;

        if self.config.dio2_rf_switch {
            self.write_command(commands::SET_DIO2_AS_RF_SWITCH_CTRL, &[0x01])?;
        }
        self.write_command(commands::SET_REGULATOR_MODE, &[u8::from(self.config.use_dcdc)])?;
        self.write_command(commands::SET_PKT_TYPE, &[0x01])?;
        // Public network sync word.
        self.write_register(registers::REG_LORA_SYNC_WORD_MSB, &[0x34, 0x44])?;
        self.write_command(commands::SET_BUFFER_BASE_ADDRESS, &[0x00, 0x00])?;

        let [mask_hi, mask_lo] = irq::LORAWAN.to_be_bytes();
        self.write_command(
            commands::SET_DIO_IRQ_PARAMS,
            &[mask_hi, mask_lo, mask_hi, mask_lo, 0, 0, 0, 0],
        )?;
        self.clear_irq(irq::ALL)?;
        self.mode = Mode::Standby;
        Ok(())
    }

    fn configure_tx(&mut self, config: TxConfig) -> Result<(), Self::Error> {
        bandwidth_code(config.modulation.bandwidth).ok_or(RadioError::Config)?;
        self.tx_config = Some(config);
        Ok(())
    }

    fn configure_rx(&mut self, config: RxConfig) -> Result<(), Self::Error> {
        bandwidth_code(config.modulation.bandwidth).ok_or(RadioError::Config)?;
        self.rx_config = Some(config);
        Ok(())
    }

    fn transmit(&mut self, buffer: &[u8]) -> Result<(), Self::Error> {
        let config = self.tx_config.ok_or(RadioError::NotConfigured)?;
        let len = u8::try_from(buffer.len()).map_err(|_| RadioError::Config)?;

        self.write_command(commands::SET_STANDBY, &[0x00])?;
        self.set_frequency(config.frequency)?;
        self.set_tx_power(config.power)?;
        self.set_modulation(&config.modulation)?;
        self.set_packet_params(len, true, false)?;

        self.ready()?;
        self.cs.set_low().map_err(|_| RadioError::Gpio)?;
        let result = self
            .spi
            .write(&[commands::WRITE_BUFFER, 0x00])
            .and_then(|_| self.spi.write(buffer));
        self.cs.set_high().map_err(|_| RadioError::Gpio)?;
        result.map_err(|_| RadioError::Spi)?;

        self.clear_irq(irq::ALL)?;
        self.write_command(commands::SET_TX, &[0x00, 0x00, 0x00])?;
        self.mode = Mode::Tx;
        Ok(())
    }

    fn receive(&mut self) -> Result<(), Self::Error> {
        let config = self.rx_config.ok_or(RadioError::NotConfigured)?;

        self.write_command(commands::SET_STANDBY, &[0x00])?;
        self.set_frequency(config.frequency)?;
        self.set_modulation(&config.modulation)?;
        // Downlinks carry no payload CRC and use inverted IQ.
        self.set_packet_params(0xFF, false, true)?;
        self.write_command(commands::STOP_TIMER_ON_PREAMBLE, &[0x00])?;
        self.write_command(
            commands::SET_LORA_SYMB_NUM_TIMEOUT,
            &[config.symbol_timeout.min(248) as u8],
        )?;

        self.clear_irq(irq::ALL)?;
        let timeout = rtc_steps(config.timeout_us).min(0x00FF_FFFE).to_be_bytes();
        self.write_command(commands::SET_RX, &[timeout[1], timeout[2], timeout[3]])?;
        self.mode = Mode::Rx;
        Ok(())
    }

    fn poll_event(&mut self, buffer: &mut [u8]) -> nb::Result<RadioEvent, Self::Error> {
        if !self.dio1.is_high().map_err(|_| nb::Error::Other(RadioError::Gpio))? {
            return Err(nb::Error::WouldBlock);
        }

        let status = self.irq_status()?;
        self.clear_irq(status)?;

        let event = match self.mode {
            Mode::Tx if status & irq::TX_DONE != 0 => RadioEvent::TxDone,
            Mode::Rx if status & (irq::CRC_ERR | irq::HEADER_ERR) != 0 => RadioEvent::CrcError,
            Mode::Rx if status & irq::RX_DONE != 0 => {
                let (len, rssi, snr) = self.read_frame(buffer)?;
                RadioEvent::RxDone { len, rssi, snr }
            }
            Mode::Rx if status & irq::TIMEOUT != 0 => RadioEvent::RxTimeout,
            _ => return Err(nb::Error::WouldBlock),
        };

        self.mode = Mode::Standby;
        Ok(event)
    }

    fn sleep(&mut self) -> Result<(), Self::Error> {
        // Warm start keeps the configuration across sleep.
        self.write_command(commands::SET_SLEEP, &[0x04])?;
        self.mode = Mode::Sleep;
        Ok(())
    }

    fn standby(&mut self) -> Result<(), Self::Error> {
        self.write_command(commands::SET_STANDBY, &[0x00])?;
        self.mode = Mode::Standby;
        Ok(())
    }
}

/// PLL word for `frequency` Hz
fn pll_steps(frequency: u32) -> u32 {
    ((u64::from(frequency) << 25) / XTAL_FREQ) as u32
}

/// Chip timer steps (15.625 us) covering `us` microseconds
fn rtc_steps(us: u32) -> u32 {
    (u64::from(us) * 1_000).div_ceil(RTC_STEP_NS) as u32
}

/// LoRa bandwidth register code
fn bandwidth_code(bandwidth: u32) -> Option<u8> {
    match bandwidth {
        125_000 => Some(0x04),
        250_000 => Some(0x05),
        500_000 => Some(0x06),
        _ => None,
    }
}
