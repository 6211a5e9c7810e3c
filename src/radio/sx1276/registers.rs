//! # SX1276 Register Definitions and Constants
//!
//! Register addresses, operating mode bits and modem constants for the
//! Semtech SX1276 in LoRa mode. Only the subset the driver touches is
//! defined; addresses follow the SX1276/77/78/79 datasheet register map.
//!
//! All transfers are two bytes over SPI mode 0, MSB first: the address
//! byte carries the write flag in its MSB, followed by one data byte.

// =============================================================================
// SX1276 Register Addresses (LoRa page)
// =============================================================================

/// FIFO read/write access register
pub const REG_FIFO: u8 = 0x00;

/// Operating mode and LoRa/FSK selection
pub const REG_OP_MODE: u8 = 0x01;

/// RF carrier frequency (MSB)
pub const REG_FRF_MSB: u8 = 0x06;

/// RF carrier frequency (MID)
pub const REG_FRF_MID: u8 = 0x07;

/// RF carrier frequency (LSB)
pub const REG_FRF_LSB: u8 = 0x08;

/// PA selection and output power control
pub const REG_PA_CONFIG: u8 = 0x09;

/// Over current protection control
pub const REG_OCP: u8 = 0x0B;

/// LNA gain and boost settings
pub const REG_LNA: u8 = 0x0C;

/// FIFO SPI access pointer
pub const REG_FIFO_ADDR_PTR: u8 = 0x0D;

/// Start of TX data in the FIFO
pub const REG_FIFO_TX_BASE_ADDR: u8 = 0x0E;

/// Start of RX data in the FIFO
pub const REG_FIFO_RX_BASE_ADDR: u8 = 0x0F;

/// Address of the last packet received
pub const REG_FIFO_RX_CURRENT_ADDR: u8 = 0x10;

/// IRQ flags (write 1 to clear)
pub const REG_IRQ_FLAGS: u8 = 0x12;

/// Number of payload bytes of the last packet
pub const REG_RX_NB_BYTES: u8 = 0x13;

/// SNR of the last packet (two's complement, quarter dB)
pub const REG_PKT_SNR_VALUE: u8 = 0x19;

/// RSSI of the last packet
pub const REG_PKT_RSSI_VALUE: u8 = 0x1A;

/// Current RSSI
pub const REG_RSSI_VALUE: u8 = 0x1B;

/// Modem config 1: bandwidth, coding rate, header mode
pub const REG_MODEM_CONFIG_1: u8 = 0x1D;

/// Modem config 2: spreading factor, CRC
pub const REG_MODEM_CONFIG_2: u8 = 0x1E;

/// Preamble length (MSB)
pub const REG_PREAMBLE_MSB: u8 = 0x20;

/// Preamble length (LSB)
pub const REG_PREAMBLE_LSB: u8 = 0x21;

/// TX payload length
pub const REG_PAYLOAD_LENGTH: u8 = 0x22;

/// Modem config 3: AGC, low data rate optimize
pub const REG_MODEM_CONFIG_3: u8 = 0x26;

/// LoRa detection optimize
pub const REG_DETECTION_OPTIMIZE: u8 = 0x31;

/// LoRa detection threshold
pub const REG_DETECTION_THRESHOLD: u8 = 0x37;

/// Sync word
pub const REG_SYNC_WORD: u8 = 0x39;

/// DIO0..DIO3 mapping
pub const REG_DIO_MAPPING_1: u8 = 0x40;

/// Silicon revision (read-only)
pub const REG_VERSION: u8 = 0x42;

/// Higher power settings of the PA
pub const REG_PA_DAC: u8 = 0x4D;

// =============================================================================
// Operating modes
// =============================================================================

/// LoRa mode select bit, ORed into every mode write
pub const LONG_RANGE_MODE: u8 = 0x80;

pub const MODE_SLEEP: u8 = 0x00;
pub const MODE_STDBY: u8 = 0x01;
pub const MODE_TX: u8 = 0x03;
pub const MODE_RX_CONTINUOUS: u8 = 0x05;
pub const MODE_RX_SINGLE: u8 = 0x06;

// =============================================================================
// Modem constants
// =============================================================================

/// Crystal oscillator frequency in Hz
pub const FXOSC_HZ: u64 = 32_000_000;

/// Expected value of [`REG_VERSION`] for the SX1276 family
pub const CHIP_VERSION: u8 = 0x12;

/// HF-band RSSI offset: `rssi_dbm = raw - 157`
pub const RSSI_OFFSET_HF: i16 = 157;

/// LNA boost bits ORed into [`REG_LNA`] during init
pub const LNA_BOOST_HF: u8 = 0x03;

/// Auto AGC in modem config 3
pub const MC3_AGC_AUTO_ON: u8 = 0x04;

/// CRC enable bit in modem config 2
pub const MC2_RX_PAYLOAD_CRC_ON: u8 = 0x04;

/// Implicit header bit in modem config 1
pub const MC1_IMPLICIT_HEADER: u8 = 0x01;

/// Detection optimize / threshold pairs; SF6 needs its own constants
pub const DETECT_OPT_SF6: u8 = 0xC5;
pub const DETECT_OPT_SF7_12: u8 = 0xC3;
pub const DETECT_THRESH_SF6: u8 = 0x0C;
pub const DETECT_THRESH_SF7_12: u8 = 0x0A;

/// PA_BOOST output select in [`REG_PA_CONFIG`]
pub const PA_SELECT_BOOST: u8 = 0x80;

/// PA DAC setting for output power up to 17 dBm
pub const PA_DAC_DEFAULT: u8 = 0x84;

/// PA DAC setting enabling the +20 dBm option
pub const PA_DAC_BOOST: u8 = 0x87;

/// Over-current protection trim: 100 mA
pub const OCP_100_MA: u8 = 0x2B;

/// Over-current protection trim: 240 mA
pub const OCP_240_MA: u8 = 0x3F;

/// DIO0 mapped to RxDone in [`REG_DIO_MAPPING_1`]
pub const DIO0_RX_DONE: u8 = 0x00;

/// Register-encoded bandwidth bits (modem config 1 high nibble), ordered
/// to match [`crate::config::BANDWIDTHS_HZ`].
pub const BANDWIDTH_BITS: [u8; 10] = [
    0x00, 0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80, 0x90,
];

/// Look up the modem-config-1 bits for a bandwidth in Hz.
pub fn bandwidth_bits(bandwidth_hz: u32) -> Option<u8> {
    crate::config::BANDWIDTHS_HZ
        .iter()
        .position(|&hz| hz == bandwidth_hz)
        .map(|i| BANDWIDTH_BITS[i])
}

/// Frf register value for a carrier frequency, rounded to the nearest
/// synthesizer step of `FXOSC / 2^19` (about 61 Hz).
pub fn frf_from_hz(freq_hz: u32) -> u32 {
    ((((freq_hz as u64) << 19) + FXOSC_HZ / 2) / FXOSC_HZ) as u32
}

/// Carrier frequency for an Frf register value.
pub fn frf_to_hz(frf: u32) -> u32 {
    (((frf as u64) * FXOSC_HZ + (1 << 18)) >> 19) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bandwidth_bits_table() {
        assert_eq!(bandwidth_bits(7_800), Some(0x00));
        assert_eq!(bandwidth_bits(125_000), Some(0x70));
        assert_eq!(bandwidth_bits(250_000), Some(0x80));
        assert_eq!(bandwidth_bits(500_000), Some(0x90));
        assert_eq!(bandwidth_bits(100_000), None);
    }

    #[test]
    fn test_frf_915_mhz() {
        // 915 MHz / (32 MHz / 2^19) = 14991360 exactly
        assert_eq!(frf_from_hz(915_000_000), 14_991_360);
        assert_eq!(frf_to_hz(14_991_360), 915_000_000);
    }

    proptest! {
        // Frf write then read reconstructs the frequency within one
        // synthesizer step (~61 Hz)
        #[test]
        fn prop_frf_roundtrip(freq in 137_000_000u32..=1_020_000_000) {
            let back = frf_to_hz(frf_from_hz(freq));
            let step = (FXOSC_HZ >> 19) as i64 + 1;
            prop_assert!(((back as i64) - (freq as i64)).abs() <= step);
        }
    }
}
