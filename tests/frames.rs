use gnss_assist::ubx::{
    split_frames, validate, validate_batch, Frame, FramingError, RawPacket, SendablePacket,
    Validation,
};
use proptest::prelude::*;

const POLL: [u8; 8] = [0xB5, 0x62, 0x01, 0x03, 0x00, 0x00, 0x04, 0x0D];

fn frame(class: u8, id: u8, payload: &[u8]) -> Vec<u8> {
    RawPacket { class, id, payload }.to_bytes().collect()
}

#[test]
fn poll_frame_scenario() {
    assert_eq!(validate(&POLL), Validation::Valid(8));

    let mut flipped = POLL;
    flipped[7] = 0x0E;
    assert_eq!(validate(&flipped), Validation::Invalid);

    assert_eq!(validate(&POLL[..4]), Validation::Incomplete);
}

#[test]
fn demux_surfaces_mid_stream_corruption() {
    let mut blob = frame(0x13, 0x00, &[1, 2, 3, 4]);
    let mut bad = frame(0x13, 0x20, &[5, 6, 7]);
    let last = bad.len() - 1;
    bad[last] ^= 0x01;
    blob.extend_from_slice(&bad);
    blob.extend_from_slice(&POLL);

    let results: Vec<_> = split_frames(&blob).collect();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(FramingError::BadChecksum { .. })));
    assert!(matches!(
        validate_batch(&blob),
        Err(FramingError::BadChecksum { .. })
    ));
}

proptest! {
    #[test]
    fn short_input_is_incomplete(bytes in proptest::collection::vec(any::<u8>(), 0..8)) {
        prop_assert_eq!(validate(&bytes), Validation::Incomplete);
    }

    #[test]
    fn missing_magic_is_invalid(
        head in any::<[u8; 2]>().prop_filter("not the magic", |h| *h != [0xB5, 0x62]),
        rest in proptest::collection::vec(any::<u8>(), 6..64),
    ) {
        let mut bytes = head.to_vec();
        bytes.extend_from_slice(&rest);
        prop_assert_eq!(validate(&bytes), Validation::Invalid);
    }

    #[test]
    fn trailing_bytes_are_ignored(
        class in any::<u8>(),
        id in any::<u8>(),
        payload in proptest::collection::vec(any::<u8>(), 0..300),
        trailer in proptest::collection::vec(any::<u8>(), 0..32),
    ) {
        let mut bytes = frame(class, id, &payload);
        let len = bytes.len();
        bytes.extend_from_slice(&trailer);
        prop_assert_eq!(validate(&bytes), Validation::Valid(len));

        let parsed = Frame::parse(&bytes).unwrap();
        prop_assert_eq!(parsed.payload(), &payload[..]);
        prop_assert_eq!((parsed.class_id(), parsed.msg_id()), (class, id));
    }

    #[test]
    fn any_payload_mutation_breaks_the_checksum(
        payload in proptest::collection::vec(any::<u8>(), 1..128),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let mut bytes = frame(0x0b, 0x33, &payload);
        let at = 6 + index.index(payload.len());
        bytes[at] ^= flip;
        prop_assert_eq!(validate(&bytes), Validation::Invalid);
    }

    #[test]
    fn demux_yields_every_frame_in_order(
        payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..40), 0..10),
    ) {
        let blob: Vec<u8> = payloads
            .iter()
            .enumerate()
            .flat_map(|(i, p)| frame(0x13, i as u8, p))
            .collect();
        let summary = validate_batch(&blob).unwrap();
        prop_assert_eq!(summary.frames, payloads.len());
        prop_assert_eq!(summary.bytes, blob.len());

        for (i, (frame, payload)) in split_frames(&blob).zip(&payloads).enumerate() {
            let frame = frame.unwrap();
            prop_assert_eq!(frame.msg_id(), i as u8);
            prop_assert_eq!(frame.payload(), &payload[..]);
        }
    }
}
