use silabs_flasher::ebl::EblImage;
use silabs_flasher::flasher::read_gbl_metadata;
use silabs_flasher::gbl::{GblImage, TagId};

fn build_gbl(metadata_json: &[u8]) -> Vec<u8> {
    let tags = vec![
        (TagId::Header, vec![0, 0, 0, 0]),
        (TagId::Metadata, metadata_json.to_vec()),
        (TagId::End, vec![0, 0, 0, 0]),
    ];
    GblImage { tags }.serialize()
}

#[test]
fn test_read_gbl_metadata_through_flasher_entrypoint() {
    let json = br#"{"baudrate":460800,"fw_type":"openthread_rcp","metadata_version":2,"ot_rcp_version":"2.2.2.0"}"#;
    let bytes = build_gbl(json);

    let metadata = read_gbl_metadata(&bytes).unwrap();
    assert_eq!(metadata.baudrate, Some(460_800));
    assert!(metadata.ot_rcp_version.is_some());
}

#[test]
fn test_gbl_image_survives_a_reparse_cycle() {
    let json = br#"{"metadata_version":1}"#;
    let bytes = build_gbl(json);

    let image = GblImage::parse(&bytes).unwrap();
    let reserialized = image.serialize();
    let reparsed = GblImage::parse(&reserialized).unwrap();

    assert_eq!(reparsed.tags.len(), image.tags.len());
}

#[test]
fn test_ebl_image_never_reports_metadata() {
    let tags = vec![
        (silabs_flasher::ebl::EblTagId::Header, vec![0, 0]),
        (silabs_flasher::ebl::EblTagId::End, vec![0, 0, 0, 0]),
    ];
    let bytes = EblImage { tags }.serialize();
    let image = EblImage::parse(&bytes).unwrap();
    assert!(image.get_nabucasa_metadata().is_err());
}
