use crate::meta::{
    index_filename, session_filename_of_index, CacheInfo, Manifest, MetaIndex, DOCUMENT_VERSION,
    LEGACY_VERSION,
};
use crate::tests::helpers::sample_index;
use snapvault_types::SnapError;

#[test]
fn index_seal_and_verify() {
    let mut index = sample_index("20250101000000_a.fastshot");
    assert!(index.checksum_valid());

    index.metadata.desc = "edited".into();
    assert!(!index.checksum_valid());
    index.seal().unwrap();
    assert!(index.checksum_valid());
}

#[test]
fn index_parse_verified_round_trip() {
    let index = sample_index("20250101000000_a.fastshot");
    let bytes = serde_json::to_vec_pretty(&index).unwrap();
    let parsed = MetaIndex::parse_verified(&bytes, Some("20250101000000_a.fastshot")).unwrap();
    assert_eq!(parsed, index);
}

#[test]
fn index_parse_rejects_filename_mismatch() {
    let index = sample_index("20250101000000_a.fastshot");
    let bytes = serde_json::to_vec(&index).unwrap();
    let err = MetaIndex::parse_verified(&bytes, Some("20250101000000_b.fastshot")).unwrap_err();
    assert!(matches!(err, SnapError::Integrity(_)));
}

#[test]
fn index_parse_rejects_tampered_content() {
    let index = sample_index("20250101000000_a.fastshot");
    let json = String::from_utf8(serde_json::to_vec_pretty(&index).unwrap()).unwrap();
    let tampered = json.replace("\"Test\"", "\"Tost\"");
    let err = MetaIndex::parse_verified(tampered.as_bytes(), None).unwrap_err();
    assert!(matches!(err, SnapError::Integrity(_)));
}

#[test]
fn legacy_index_fills_defaults_and_upgrades() {
    // Pre-1.0 document: no version, no checksum, sparse metadata.
    let legacy = r#"{
        "filename": "20240101000000_old.fastshot",
        "metadata": {"name": "old"}
    }"#;
    let mut index = MetaIndex::parse_verified(legacy.as_bytes(), None).unwrap();
    assert_eq!(index.version, LEGACY_VERSION);
    assert!(index.is_legacy());
    assert_eq!(index.metadata.image_count, 0);
    assert!(index.metadata.tags.is_empty());
    assert_eq!(index.metadata.file_size, 0);

    index.upgrade().unwrap();
    assert_eq!(index.version, DOCUMENT_VERSION);
    assert!(index.checksum_valid());
}

#[test]
fn manifest_upsert_prepends_new_and_replaces_existing() {
    let mut manifest = Manifest::new();
    manifest.upsert(sample_index("20250101000000_a.fastshot").manifest_entry());
    manifest.upsert(sample_index("20250101000001_b.fastshot").manifest_entry());
    assert_eq!(manifest.sessions[0].filename, "20250101000001_b.fastshot");
    assert_eq!(manifest.total_sessions, 2);

    // Publishing the same filename again must not duplicate the entry.
    let mut replacement = sample_index("20250101000000_a.fastshot");
    replacement.metadata.file_size = 999;
    replacement.seal().unwrap();
    manifest.upsert(replacement.manifest_entry());
    assert_eq!(manifest.total_sessions, 2);
    assert_eq!(
        manifest.find("20250101000000_a.fastshot").unwrap().file_size,
        999
    );
}

#[test]
fn manifest_checksum_covers_entries() {
    let mut manifest = Manifest::new();
    manifest.upsert(sample_index("20250101000000_a.fastshot").manifest_entry());
    manifest.seal().unwrap();
    assert!(manifest.checksum_valid());

    manifest.sessions[0].file_size += 1;
    assert!(!manifest.checksum_valid());
}

#[test]
fn manifest_entry_checksum_matches_index_checksum() {
    let index = sample_index("20250101000000_a.fastshot");
    let entry = index.manifest_entry();
    assert_eq!(entry.checksum, index.checksum);
}

#[test]
fn cache_info_seal_round_trip() {
    let mut info = CacheInfo::new();
    info.seal().unwrap();
    assert!(info.checksum_valid());
    info.total_meta_files = 7;
    assert!(!info.checksum_valid());
}

#[test]
fn filename_mapping_round_trips() {
    assert_eq!(
        index_filename("20250621114615_tt1.fastshot"),
        "20250621114615_tt1.meta.json"
    );
    assert_eq!(
        session_filename_of_index("20250621114615_tt1.meta.json").unwrap(),
        "20250621114615_tt1.fastshot"
    );
    assert!(session_filename_of_index("not-an-index.json").is_none());
}
