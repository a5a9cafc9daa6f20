use silabs_flasher::Version;

#[test]
fn test_legacy_and_modern_version_strings_compare_sensibly() {
    let legacy = Version::parse("6.10.3.0 build 297");
    let modern = Version::parse("7.4.4.0 build 23");
    assert!(modern > legacy);
    assert!(!modern.compatible_with(&legacy));
}

#[test]
fn test_ot_rcp_hash_suffixed_versions() {
    let a = Version::parse("SL-OPENTHREAD/2.2.2.0_GitHub-91fa1f455");
    let b = Version::parse("SL-OPENTHREAD/2.2.2.0_GitHub-deadbeef1");
    assert_eq!(a, a.clone());
    assert!(a.compatible_with(&b));
    assert_ne!(a, b);
}

#[test]
fn test_display_roundtrips_original_string() {
    let raw = "7.2.2.0 build 190";
    assert_eq!(Version::parse(raw).to_string(), raw);
}
