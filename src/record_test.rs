use arbitrary::Unstructured;
use rand::{prelude::random, rngs::StdRng, Rng, SeedableRng};

use super::*;

#[test]
fn test_kind() {
    for code in 0..=12_u64 {
        let kind = Kind::try_from(code).unwrap();
        assert_eq!(kind as u64, code);
    }
    assert!(Kind::try_from(13).is_err());
    assert!(Kind::try_from(255).is_err());

    assert_eq!(Kind::CreateIndex.to_string(), "create_index");
    assert_eq!(Kind::Snapshot.to_string(), "snapshot");
    assert_eq!(Kind::TruncateIndex.to_string(), "truncate_index");
}

#[test]
fn test_record_codec() {
    let seed: u64 = random();
    let mut rng = StdRng::seed_from_u64(seed);
    println!("test_record_codec {}", seed);

    for _i in 0..1000 {
        let record: Record = {
            let bytes = rng.gen::<[u8; 32]>();
            let mut uns = Unstructured::new(&bytes);
            uns.arbitrary().unwrap()
        };
        let data = record.encode().unwrap();
        let out = Record::decode(&data).unwrap();
        assert_eq!(out, record, "{}", record);
    }
}

#[test]
fn test_record_codec_sparse() {
    // snapshot record carries no fields at all.
    let record = Record::snapshot();
    let data = record.encode().unwrap();
    let out = Record::decode(&data).unwrap();
    assert_eq!(out, record);
    assert_eq!(out.to_kind(), Kind::Snapshot);

    // open bounds are absent keys.
    let record = Record::insert_range(100, 3, None, Some(vec![Datum::Unsigned(8)]));
    let out = Record::decode(&record.encode().unwrap()).unwrap();
    assert_eq!(out.begin, None);
    assert_eq!(out.end, Some(vec![Datum::Unsigned(8)]));
}

#[test]
fn test_record_decode_invalid() {
    // unknown kind.
    let row = Row { kind: 13, fields: vec![] };
    let data = row.to_bytes().unwrap();
    match Record::decode(&data) {
        Err(Error::InvalidLog(_, msg)) => assert!(msg.contains("unknown kind"), "{}", msg),
        res => panic!("{:?}", res),
    }

    // unknown field tag.
    let row = Row { kind: 0, fields: vec![Field::int(99, 1)] };
    let data = row.to_bytes().unwrap();
    match Record::decode(&data) {
        Err(Error::InvalidLog(_, msg)) => assert!(msg.contains("unknown tag"), "{}", msg),
        res => panic!("{:?}", res),
    }

    // value of the wrong family for a known tag.
    let row = Row {
        kind: 0,
        fields: vec![Field { tag: KEY_INDEX_LSN, value: Value::Key(vec![]) }],
    };
    let data = row.to_bytes().unwrap();
    assert!(Record::decode(&data).is_err());

    // malformed key-part definition.
    let row = Row {
        kind: 0,
        fields: vec![Field {
            tag: KEY_DEF,
            value: Value::Parts(vec![KeyPart::new(0, "decimal", false)]),
        }],
    };
    let data = row.to_bytes().unwrap();
    match Record::decode(&data) {
        Err(Error::InvalidLog(_, msg)) => assert!(msg.contains("key-part"), "{}", msg),
        res => panic!("{:?}", res),
    }

    // garbage bytes.
    assert!(Record::decode(&[0xff, 0x00, 0x01]).is_err());
}

#[test]
fn test_record_encode_invalid() {
    let parts = vec![KeyPart::new(0, "unsigned", false), KeyPart::new(1, "float", true)];
    let record = Record::create_index(1, 0, 100, parts);
    assert!(record.encode().is_err());
}

#[test]
fn test_record_display() {
    let record = Record::create_index(512, 0, 100, vec![KeyPart::new(0, "unsigned", false)]);
    assert_eq!(
        record.to_string(),
        "create_index{index_lsn=100, index_id=0, space_id=512, key_def=[0:unsigned]}"
    );

    let record = Record::insert_slice(
        3,
        7,
        9,
        Some(vec![Datum::Unsigned(5)]),
        Some(vec![Datum::Unsigned(8)]),
    );
    assert_eq!(
        record.to_string(),
        "insert_slice{range_id=3, run_id=7, begin=[5], end=[8], slice_id=9}"
    );

    assert_eq!(Record::snapshot().to_string(), "snapshot{}");
    assert_eq!(Record::drop_run(11, 200).to_string(), "drop_run{run_id=11, gc_lsn=200}");
}
