use crate::format::*;
use proptest::prelude::*;

// -------------------- LOC roundtrips --------------------

#[test]
fn loc_roundtrip() {
    let mut words = Vec::new();
    encode_loc(SegmentKind::Alloc, 3, 100, 16, &mut words);
    assert_eq!(words.len(), 1);

    match decode_word(words[0]).unwrap() {
        Record::Loc {
            kind,
            vdev,
            offset,
            run,
        } => {
            assert_eq!(kind, SegmentKind::Alloc);
            assert_eq!(vdev, 3);
            assert_eq!(offset, 100);
            assert_eq!(run, 16);
        }
        other => panic!("expected LOC, got {other:?}"),
    }
}

#[test]
fn free_kind_is_preserved() {
    let mut words = Vec::new();
    encode_loc(SegmentKind::Free, 0, 0, 1, &mut words);
    assert!(matches!(
        decode_word(words[0]).unwrap(),
        Record::Loc {
            kind: SegmentKind::Free,
            ..
        }
    ));
}

#[test]
fn loc_field_extremes() {
    let mut words = Vec::new();
    encode_loc(
        SegmentKind::Free,
        VDEV_MAX,
        OFFSET_MAX - RUN_MAX + 1,
        RUN_MAX,
        &mut words,
    );
    assert_eq!(words.len(), 1);
    assert_eq!(
        decode_word(words[0]).unwrap(),
        Record::Loc {
            kind: SegmentKind::Free,
            vdev: VDEV_MAX,
            offset: OFFSET_MAX - RUN_MAX + 1,
            run: RUN_MAX,
        }
    );
}

#[test]
fn long_runs_split_into_consecutive_records() {
    let mut words = Vec::new();
    encode_loc(SegmentKind::Alloc, 1, 1000, RUN_MAX * 2 + 5, &mut words);
    assert_eq!(words.len(), 3);

    let mut cursor = 1000;
    let mut total = 0;
    for word in words {
        match decode_word(word).unwrap() {
            Record::Loc { offset, run, .. } => {
                assert_eq!(offset, cursor, "split records must be consecutive");
                cursor += run;
                total += run;
            }
            other => panic!("expected LOC, got {other:?}"),
        }
    }
    assert_eq!(total, RUN_MAX * 2 + 5);
}

#[test]
#[should_panic(expected = "out of range")]
fn oversized_offset_is_rejected() {
    let mut words = Vec::new();
    encode_loc(SegmentKind::Alloc, 0, OFFSET_MAX, 2, &mut words);
}

// -------------------- SKIP --------------------

#[test]
fn skip_roundtrip() {
    let mut words = Vec::new();
    encode_skip(17, &mut words);
    assert_eq!(decode_word(words[0]).unwrap(), Record::Skip(17));
}

#[test]
fn unknown_type_tag_is_corruption() {
    // Tag 0b00 and 0b11 are unassigned.
    assert!(decode_word(0).is_err());
    assert!(decode_word(u64::MAX).is_err());
}

// -------------------- Header --------------------

#[test]
fn header_roundtrip() {
    let header = Header {
        shift: 9,
        length: 24,
        alloc: -4096,
        chunk_crcs: vec![0xDEAD_BEEF],
    };
    let parsed = Header::from_bytes(&header.to_bytes()).unwrap();
    assert_eq!(parsed, header);
}

#[test]
fn header_rejects_bad_magic() {
    let mut bytes = Header {
        shift: 9,
        length: 0,
        alloc: 0,
        chunk_crcs: vec![],
    }
    .to_bytes();
    bytes[0] ^= 0xFF;
    assert!(Header::from_bytes(&bytes).is_err());
}

#[test]
fn header_rejects_wrong_chunk_count() {
    let header = Header {
        shift: 9,
        length: 16,
        alloc: 0,
        // 16 bytes of records need exactly one chunk checksum.
        chunk_crcs: vec![1, 2],
    };
    assert!(Header::from_bytes(&header.to_bytes()).is_err());
}

#[test]
fn header_rejects_truncation() {
    let bytes = Header {
        shift: 9,
        length: 8,
        alloc: 8,
        chunk_crcs: vec![7],
    }
    .to_bytes();
    assert!(Header::from_bytes(&bytes[..bytes.len() - 1]).is_err());
}

// -------------------- Properties --------------------

proptest! {
    /// Encoding any in-range extent and decoding it back yields the same
    /// (kind, vdev, offset, run) tuple, across record splits.
    #[test]
    fn encode_decode_roundtrip(
        is_alloc in any::<bool>(),
        vdev in 0u32..=VDEV_MAX,
        offset in 0u64..=OFFSET_MAX / 2,
        run in 1u64..RUN_MAX * 3,
    ) {
        let kind = if is_alloc { SegmentKind::Alloc } else { SegmentKind::Free };
        let mut words = Vec::new();
        encode_loc(kind, vdev, offset, run, &mut words);

        let mut cursor = offset;
        let mut total = 0u64;
        for word in words {
            match decode_word(word).unwrap() {
                Record::Loc { kind: k, vdev: v, offset: o, run: r } => {
                    prop_assert_eq!(k, kind);
                    prop_assert_eq!(v, vdev);
                    prop_assert_eq!(o, cursor);
                    cursor += r;
                    total += r;
                }
                other => prop_assert!(false, "expected LOC, got {:?}", other),
            }
        }
        prop_assert_eq!(total, run);
    }

    /// A stream of SKIPs advances the decode cursor by exactly the encoded
    /// number of TXGs.
    #[test]
    fn skip_advances_cursor_exactly(skips in prop::collection::vec(1u64..1000, 1..10)) {
        let mut words = Vec::new();
        for &n in &skips {
            encode_skip(n, &mut words);
        }

        let mut cursor = 0u64;
        for word in words {
            match decode_word(word).unwrap() {
                Record::Skip(n) => cursor += n,
                other => prop_assert!(false, "expected SKIP, got {:?}", other),
            }
        }
        prop_assert_eq!(cursor, skips.iter().sum::<u64>());
    }
}
