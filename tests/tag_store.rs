use plc_gateway::error::GatewayError;
use plc_gateway::tags::store::{TagPatch, TagStore};
use plc_gateway::tags::structures::{now_ns, PlcName, Quality, TagDatatype, TagRecord, TagValue};
use rust_decimal::Decimal;
use std::str::FromStr;

fn sample_tag(id: &str, datatype: TagDatatype) -> TagRecord {
    TagRecord::new(id, PlcName::Compactlogix, format!("Main.{id}"), datatype)
}

#[test]
fn insert_then_get_returns_equal_record() {
    let store = TagStore::new();
    let mut tag = sample_tag("Temp", TagDatatype::Decimal);
    tag.value = TagValue::Decimal(Decimal::from_str("1.2300").unwrap());
    tag.writable = true;
    store.insert(tag.clone()).unwrap();

    let read = store.get("Temp").expect("tag should exist");
    assert_eq!(read.id, tag.id);
    assert_eq!(read.plc, tag.plc);
    assert_eq!(read.address, tag.address);
    assert_eq!(read.datatype, tag.datatype);
    assert_eq!(read.value, tag.value);
    assert_eq!(read.writable, tag.writable);
    assert_eq!(read.quality, Quality::Uninitialized);
    assert_eq!(read.last_update_ns, 0);
}

#[test]
fn duplicate_insert_is_a_conflict() {
    let store = TagStore::new();
    store.insert(sample_tag("A", TagDatatype::Int)).unwrap();
    assert!(matches!(
        store.insert(sample_tag("A", TagDatatype::Int)),
        Err(GatewayError::AlreadyExists(_))
    ));
}

#[test]
fn update_value_stamps_quality_and_timestamp_together() {
    let store = TagStore::new();
    store.insert(sample_tag("Count", TagDatatype::Int)).unwrap();

    let ts = now_ns();
    store
        .update_value("Count", &TagValue::Int(42), Quality::Good, ts)
        .unwrap();
    let read = store.get("Count").unwrap();
    assert_eq!(read.value, TagValue::Int(42));
    assert_eq!(read.quality, Quality::Good);
    assert_eq!(read.last_update_ns, ts);
}

#[test]
fn update_value_coerces_raw_int_into_decimal_tag() {
    let store = TagStore::new();
    let mut tag = TagRecord::new("Scaled", PlcName::Slc500, "N7:0", TagDatatype::Decimal);
    tag.scale_mul = 0.1;
    tag.decimals = Some(2);
    store.insert(tag).unwrap();

    store
        .update_value("Scaled", &TagValue::Int(123), Quality::Good, now_ns())
        .unwrap();
    match store.get("Scaled").unwrap().value {
        TagValue::Decimal(d) => assert_eq!(d.to_string(), "12.30"),
        other => panic!("expected decimal, got {:?}", other),
    }
}

#[test]
fn update_value_on_deleted_tag_is_not_found() {
    let store = TagStore::new();
    store.insert(sample_tag("Gone", TagDatatype::Int)).unwrap();
    store.delete("Gone").unwrap();
    assert!(matches!(
        store.update_value("Gone", &TagValue::Int(1), Quality::Good, now_ns()),
        Err(GatewayError::NotFound(_))
    ));
}

#[test]
fn patch_updates_value_and_writable_only_when_shapes_match() {
    let store = TagStore::new();
    let mut tag = sample_tag("W", TagDatatype::Real);
    tag.writable = false;
    store.insert(tag).unwrap();

    let updated = store
        .patch(
            "W",
            TagPatch {
                value: Some(TagValue::Real(9.5)),
                writable: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(updated.value, TagValue::Real(9.5));
    assert!(updated.writable);

    assert!(matches!(
        store.patch(
            "W",
            TagPatch {
                value: Some(TagValue::Text("nope".into())),
                ..Default::default()
            },
        ),
        Err(GatewayError::TypeMismatch(_))
    ));
}

#[test]
fn snapshot_by_plc_filters_and_clones() {
    let store = TagStore::new();
    store.insert(sample_tag("C1", TagDatatype::Int)).unwrap();
    store
        .insert(TagRecord::new("S1", PlcName::Slc500, "N7:0", TagDatatype::Int))
        .unwrap();

    let compact = store.snapshot_by_plc(PlcName::Compactlogix);
    assert_eq!(compact.len(), 1);
    assert_eq!(compact[0].id, "C1");
    assert_eq!(store.snapshot().len(), 2);
}

#[test]
fn concurrent_patch_and_update_keep_records_whole() {
    let store = TagStore::new();
    let mut tag = sample_tag("Shared", TagDatatype::Int);
    tag.writable = true;
    store.insert(tag).unwrap();

    let writer_store = store.clone();
    let writer = std::thread::spawn(move || {
        for i in 0..500i64 {
            writer_store
                .update_value("Shared", &TagValue::Int(i), Quality::Good, now_ns())
                .unwrap();
        }
    });
    let patcher_store = store.clone();
    let patcher = std::thread::spawn(move || {
        for i in 0..500i64 {
            let _ = patcher_store.patch(
                "Shared",
                TagPatch {
                    value: Some(TagValue::Int(-i)),
                    ..Default::default()
                },
            );
        }
    });
    writer.join().unwrap();
    patcher.join().unwrap();

    // Whichever writer won, the record is whole and Int-shaped.
    let read = store.get("Shared").unwrap();
    assert!(matches!(read.value, TagValue::Int(_)));
}
