//! Tests for the L2CAP configuration-option codec

use super::config::*;
use super::psm::Psm;

#[test]
fn test_psm_value_conversion() {
    assert_eq!(Psm::Sdp.value(), 0x0001);
    assert_eq!(Psm::Rfcomm.value(), 0x0003);
    assert_eq!(Psm::Avdtp.value(), 0x0019);

    assert_eq!(Psm::from_value(0x0001), Some(Psm::Sdp));
    assert_eq!(Psm::from_value(0x0019), Some(Psm::Avdtp));
    assert_eq!(Psm::from_value(0x1001), Some(Psm::Dynamic(0x1001)));

    // Even values in the dynamic range are invalid.
    assert_eq!(Psm::from_value(0x1002), None);
}

#[test]
fn test_decode_mtu_option() {
    let data = [0x01, 0x02, 0x30, 0x00];
    let config = ChannelConfiguration::decode(&data).unwrap();

    assert_eq!(config.mtu.unwrap().mtu, 0x0030);
    assert!(config.retransmission_and_flow_control.is_none());
    assert!(config.unknown_options.is_empty());
}

#[test]
fn test_decode_retransmission_option() {
    let data = [
        0x04, 0x09, // type, length
        0x03, // mode: enhanced retransmission
        0x08, // tx window size
        0x03, // max transmit
        0xA0, 0x0F, // rtx timeout: 4000
        0xE8, 0x2E, // monitor timeout: 12008
        0x00, 0x04, // mps: 1024
    ];
    let config = ChannelConfiguration::decode(&data).unwrap();

    let rfc = config.retransmission_and_flow_control.unwrap();
    assert_eq!(rfc.mode, RFC_MODE_ENHANCED_RETRANSMISSION);
    assert_eq!(rfc.tx_window_size, 8);
    assert_eq!(rfc.max_transmit, 3);
    assert_eq!(rfc.rtx_timeout, 4000);
    assert_eq!(rfc.monitor_timeout, 12008);
    assert_eq!(rfc.mps, 1024);
}

#[test]
fn test_decode_rejects_bad_length() {
    // MTU option with a 3-byte payload must fail the whole decode, even
    // though a valid option follows.
    let data = [0x01, 0x03, 0x30, 0x00, 0x00, 0x02, 0x02, 0xFF, 0xFF];
    assert!(ChannelConfiguration::decode(&data).is_none());
}

#[test]
fn test_decode_rejects_truncated_payload() {
    let data = [0x01, 0x02, 0x30];
    assert!(ChannelConfiguration::decode(&data).is_none());
}

#[test]
fn test_unknown_option_preserved_hint_dropped() {
    let data = [
        0x70, 0x03, 0x01, 0x02, 0x03, // unknown, MSB clear: preserved
        0xF0, 0x02, 0xAA, 0xBB, // unknown, MSB set: hint, dropped
    ];
    let config = ChannelConfiguration::decode(&data).unwrap();

    assert_eq!(config.unknown_options.len(), 1);
    assert_eq!(config.unknown_options[0].option_type, 0x70);
    assert_eq!(config.unknown_options[0].payload, vec![0x01, 0x02, 0x03]);
}

#[test]
fn test_round_trip_preserves_bytes() {
    // MTU + RFC + FCS + flush timeout + one unknown, in encode order.
    let data = [
        0x01, 0x02, 0xA0, 0x02, // MTU: 672
        0x04, 0x09, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // RFC basic
        0x05, 0x01, 0x01, // FCS: 16-bit
        0x02, 0x02, 0xFF, 0xFF, // flush timeout: infinite
        0x6F, 0x02, 0xDE, 0xAD, // unknown, preserved verbatim
    ];

    let config = ChannelConfiguration::decode(&data).unwrap();
    assert_eq!(config.encode(), data.to_vec());
}

#[test]
fn test_round_trip_drops_hints() {
    let data = [
        0x01, 0x02, 0xA0, 0x02, // MTU
        0x80, 0x01, 0x55, // hint
    ];

    let config = ChannelConfiguration::decode(&data).unwrap();
    // Re-encoding produces only the MTU option.
    assert_eq!(config.encode(), vec![0x01, 0x02, 0xA0, 0x02]);
}

#[test]
fn test_decode_empty_is_default() {
    let config = ChannelConfiguration::decode(&[]).unwrap();
    assert_eq!(config, ChannelConfiguration::default());
}

#[test]
fn test_merge_overwrites_recognized_and_concatenates_unknown() {
    let mut older = ChannelConfiguration {
        mtu: Some(MtuOption { mtu: 48 }),
        fcs: Some(FcsOption {
            fcs_type: FcsType::SixteenBit,
        }),
        unknown_options: vec![UnknownOption {
            option_type: 0x6E,
            payload: vec![0x01],
        }],
        ..Default::default()
    };

    let newer = ChannelConfiguration {
        mtu: Some(MtuOption { mtu: 672 }),
        flush_timeout: Some(FlushTimeoutOption {
            flush_timeout: 0xFFFF,
        }),
        unknown_options: vec![UnknownOption {
            option_type: 0x6F,
            payload: vec![0x02],
        }],
        ..Default::default()
    };

    older.merge(newer);

    assert_eq!(older.mtu.unwrap().mtu, 672);
    // Untouched by the newer side.
    assert_eq!(older.fcs.unwrap().fcs_type, FcsType::SixteenBit);
    assert_eq!(older.flush_timeout.unwrap().flush_timeout, 0xFFFF);
    assert_eq!(older.unknown_options.len(), 2);
    assert_eq!(older.unknown_options[0].option_type, 0x6E);
    assert_eq!(older.unknown_options[1].option_type, 0x6F);
}

#[test]
fn test_basic_and_ertm_constructors() {
    let basic = RetransmissionAndFlowControlOption::basic_mode();
    assert_eq!(basic.mode, RFC_MODE_BASIC);
    assert_eq!(basic.mps, 0);

    let ertm = RetransmissionAndFlowControlOption::enhanced_retransmission_mode(
        8, 3, 4000, 12008, 1024,
    );
    assert_eq!(ertm.mode, RFC_MODE_ENHANCED_RETRANSMISSION);
    assert_eq!(ertm.tx_window_size, 8);
}
