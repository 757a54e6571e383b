use std::{fs, sync::Arc};

use genworker::{
    error::{RelayError, RelayStage, StoreError},
    relay::AssetRelay,
    store::DirectoryStore,
};
use tempfile::tempdir;

#[test]
fn missing_object_fails_at_fetch_and_writes_nothing() {
    let temp = tempdir().unwrap();
    let bucket = temp.path().join("bucket");
    fs::create_dir_all(&bucket).unwrap();
    let input = temp.path().join("input");
    let relay = AssetRelay::new(Arc::new(DirectoryStore::new(&bucket)), &input);

    let err = relay.relay("u1", "absent.png").unwrap_err();

    assert_eq!(err.stage(), RelayStage::Fetch);
    assert!(matches!(
        err,
        RelayError::StageFailure {
            source: StoreError::NotFound(_),
            ..
        }
    ));
    assert!(!input.exists());
}

#[test]
fn relayed_image_keeps_extension_and_content() {
    let temp = tempdir().unwrap();
    let images = temp.path().join("bucket/users/u1/images");
    fs::create_dir_all(&images).unwrap();
    let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    fs::write(images.join("photo.png"), &payload).unwrap();
    let input = temp.path().join("input");
    let relay = AssetRelay::new(
        Arc::new(DirectoryStore::new(temp.path().join("bucket"))),
        &input,
    );

    let name = relay.relay("u1", "photo.png").unwrap();

    assert!(name.ends_with(".png"), "unexpected name {name}");
    assert_ne!(name, "photo.png");
    let written = fs::read(input.join(&name)).unwrap();
    assert_eq!(written.len(), payload.len());
    assert_eq!(written, payload);
}

#[test]
fn repeated_relays_never_overwrite() {
    let temp = tempdir().unwrap();
    let images = temp.path().join("bucket/users/u1/images");
    fs::create_dir_all(&images).unwrap();
    fs::write(images.join("a.jpg"), b"jpeg").unwrap();
    let input = temp.path().join("input");
    let relay = AssetRelay::new(
        Arc::new(DirectoryStore::new(temp.path().join("bucket"))),
        &input,
    );

    let first = relay.relay("u1", "a.jpg").unwrap();
    let second = relay.relay("u1", "a.jpg").unwrap();

    assert_ne!(first, second);
    assert_eq!(fs::read_dir(&input).unwrap().count(), 2);
}
