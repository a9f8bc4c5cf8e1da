//! Proxy SAR property tests
//!
//! Any payload the reassembly limit allows must come back unchanged after
//! segmentation at any transfer size, and no frame may exceed that size.
//!
//! Run with: cargo test --test test_sar_roundtrip

use meshlight_core::proxy::{segment, ProxyPduType, Reassembler, SarError};
use proptest::prelude::*;

fn pdu_type() -> impl Strategy<Value = ProxyPduType> {
    prop_oneof![
        Just(ProxyPduType::Network),
        Just(ProxyPduType::MeshBeacon),
        Just(ProxyPduType::ProxyConfiguration),
        Just(ProxyPduType::Provisioning),
    ]
}

proptest! {
    #[test]
    fn test_segments_reassemble(
        payload in proptest::collection::vec(any::<u8>(), 0..1024),
        mtu in 5usize..=247,
        kind in pdu_type(),
    ) {
        let frames = segment(kind, &payload, mtu).expect("segment");
        prop_assert!(frames.iter().all(|f| f.len() <= mtu));
        if payload.len() <= mtu - 3 {
            prop_assert_eq!(frames.len(), 1);
        } else {
            prop_assert!(frames.len() >= 2);
        }

        let mut reassembler = Reassembler::new();
        let (last, rest) = frames.split_last().expect("at least one frame");
        for frame in rest {
            prop_assert_eq!(reassembler.push(frame).expect("push"), None);
            prop_assert!(reassembler.is_in_flight());
        }
        let pdu = reassembler.push(last).expect("push").expect("complete PDU");
        prop_assert_eq!(pdu.pdu_type, kind);
        prop_assert_eq!(pdu.payload, payload);
        prop_assert!(!reassembler.is_in_flight());
    }

    #[test]
    fn test_interrupted_pdu_is_replaced(
        first in proptest::collection::vec(any::<u8>(), 40..200),
        second in proptest::collection::vec(any::<u8>(), 0..200),
    ) {
        let mtu = 23;
        let abandoned = segment(ProxyPduType::Network, &first, mtu).expect("segment");
        let replacement = segment(ProxyPduType::Network, &second, mtu).expect("segment");

        // A new first/complete frame drops the partial PDU
        let mut reassembler = Reassembler::new();
        reassembler.push(&abandoned[0]).expect("push");
        let mut result = None;
        for frame in &replacement {
            result = reassembler.push(frame).expect("push");
        }
        prop_assert_eq!(result.expect("complete PDU").payload, second);
    }
}

#[test]
fn test_default_mtu_thresholds() {
    let fits = vec![0xAB; 20];
    assert_eq!(segment(ProxyPduType::Network, &fits, 23).expect("segment").len(), 1);

    let spills = vec![0xAB; 21];
    let frames = segment(ProxyPduType::Network, &spills, 23).expect("segment");
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].len(), 20);
    assert_eq!(frames[0][0] >> 6, 0b01);
    assert_eq!(frames[1][0] >> 6, 0b11);
}

#[test]
fn test_stray_segment_is_rejected() {
    let frames = segment(ProxyPduType::Network, &[0x55; 60], 23).expect("segment");
    let mut reassembler = Reassembler::new();

    assert_eq!(
        reassembler.push(&frames[1]),
        Err(SarError::UnexpectedSegment(meshlight_core::proxy::SarMarker::Continuation))
    );
    assert_eq!(reassembler.push(&[]), Err(SarError::EmptyFrame));
    assert_eq!(
        segment(ProxyPduType::Network, &[0; 8], 4),
        Err(SarError::TransferSizeTooSmall(4))
    );
}
