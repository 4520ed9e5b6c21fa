//! Integration tests for LocalStore.

use modelstore_core::manifest::{ModelDescriptor, RootFs};
use modelstore_core::media::{
    MEDIA_TYPE_CHAT_TEMPLATE, MEDIA_TYPE_CONFIG_ARCHIVE, MEDIA_TYPE_GGUF, MEDIA_TYPE_MMPROJ,
    MEDIA_TYPE_MODEL_CONFIG_V01,
};
use modelstore_core::{
    BytesLayer, ConfigFile, Descriptor, Digest, Format, LocalStore, Manifest, ModelBuilder,
    ModelConfig, ModelImage, ModelLayer, ProgressSink, Result, StoreError,
};
use serde_json::Value;
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// An image assembled by hand so tests control the exact config bytes.
struct TestImage {
    raw_config: Vec<u8>,
    raw_manifest: Vec<u8>,
    layers: Vec<Arc<dyn ModelLayer>>,
}

impl TestImage {
    fn new(architecture: &str, layers: Vec<Arc<dyn ModelLayer>>) -> Self {
        let config_file = ConfigFile {
            config: ModelConfig {
                format: Some(Format::Gguf),
                architecture: architecture.to_string(),
                ..Default::default()
            },
            descriptor: ModelDescriptor::default(),
            rootfs: RootFs {
                fs_type: "rootfs".to_string(),
                diff_ids: Vec::new(),
            },
        };
        let raw_config = serde_json::to_vec(&config_file).unwrap();
        let manifest = Manifest::new(
            Descriptor {
                media_type: MEDIA_TYPE_MODEL_CONFIG_V01.to_string(),
                size: raw_config.len() as u64,
                digest: Digest::sha256_of(&raw_config),
            },
            layers.iter().map(|l| l.descriptor()).collect(),
        );
        Self {
            raw_config,
            raw_manifest: serde_json::to_vec(&manifest).unwrap(),
            layers,
        }
    }
}

impl ModelImage for TestImage {
    fn raw_config(&self) -> Result<Vec<u8>> {
        Ok(self.raw_config.clone())
    }

    fn layers(&self) -> Result<Vec<Arc<dyn ModelLayer>>> {
        Ok(self.layers.clone())
    }

    fn raw_manifest(&self) -> Result<Vec<u8>> {
        Ok(self.raw_manifest.clone())
    }
}

fn gguf(data: &[u8]) -> Arc<dyn ModelLayer> {
    Arc::new(BytesLayer::new(data.to_vec(), MEDIA_TYPE_GGUF))
}

/// Counts how often its content is opened.
struct CountingLayer {
    inner: BytesLayer,
    opens: Arc<AtomicUsize>,
}

impl ModelLayer for CountingLayer {
    fn digest(&self) -> &Digest {
        self.inner.digest()
    }

    fn media_type(&self) -> &str {
        self.inner.media_type()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open()
    }
}

/// Declares a digest but fails after a few bytes, like a dropped download.
struct TruncatedLayer {
    digest: Digest,
}

struct ResetReader;

impl Read for ResetReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"))
    }
}

impl ModelLayer for TruncatedLayer {
    fn digest(&self) -> &Digest {
        &self.digest
    }

    fn media_type(&self) -> &str {
        MEDIA_TYPE_GGUF
    }

    fn size(&self) -> u64 {
        1024
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(b"partial".to_vec()).chain(ResetReader)))
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn layer(data: &[u8], media_type: &str) -> Arc<dyn ModelLayer> {
    Arc::new(BytesLayer::new(data.to_vec(), media_type))
}

fn config_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn assert_blob_intact(store: &LocalStore, layer: &Arc<dyn ModelLayer>) {
    let stored = fs::read(store.blobs().path(layer.digest())).unwrap();
    assert_eq!(&Digest::sha256_of(&stored), layer.digest());
}

fn tags(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

async fn open_store() -> (TempDir, LocalStore) {
    let temp_dir = TempDir::new().unwrap();
    let store = LocalStore::open(temp_dir.path().join("store")).await.unwrap();
    (temp_dir, store)
}

#[tokio::test]
async fn test_open_initializes_layout_and_index() {
    let (_temp_dir, store) = open_store().await;
    assert!(store.root().join("layout.json").is_file());
    assert!(store.root().join("index.json").is_file());
    assert_eq!(store.version(), "1.0.0");
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_write_same_content_twice_reads_once() {
    let (_temp_dir, store) = open_store().await;
    let opens = Arc::new(AtomicUsize::new(0));
    let layer: Arc<dyn ModelLayer> = Arc::new(CountingLayer {
        inner: BytesLayer::new(b"GGUF weights".to_vec(), MEDIA_TYPE_GGUF),
        opens: opens.clone(),
    });
    let image = TestImage::new("llama", vec![layer.clone()]);

    let first = store.write(&image, &[], None).await.unwrap();
    let second = store.write(&image, &[], None).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    let stored = fs::read(store.blobs().path(layer.digest())).unwrap();
    assert_eq!(&Digest::sha256_of(&stored), layer.digest());
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_manifest_with_missing_blob_is_rejected() {
    let (_temp_dir, store) = open_store().await;
    let image = TestImage::new("llama", vec![gguf(b"never stored")]);

    let err = store
        .manifests()
        .write(&image.digest().unwrap(), &image.raw_manifest)
        .unwrap_err();
    assert!(matches!(err, StoreError::Integrity { .. }));

    let err = store.write_lightweight(&image, &tags(&["m:v1"])).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(store.list().await.unwrap().is_empty());
    assert!(store.read("m:v1").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_interrupted_layer_leaves_nothing_visible() {
    let (_temp_dir, store) = open_store().await;
    let good = gguf(b"first shard");
    let truncated: Arc<dyn ModelLayer> = Arc::new(TruncatedLayer {
        digest: Digest::sha256_of(b"the full second shard"),
    });
    let image = TestImage::new("llama", vec![good.clone(), truncated.clone()]);

    let err = store.write(&image, &tags(&["m:v1"]), None).await.unwrap_err();
    assert!(matches!(err, StoreError::Io { .. }));

    assert!(!store.blobs().has(truncated.digest()).unwrap());
    let shard_dir = store.blobs().path(truncated.digest());
    let leftovers: Vec<_> = fs::read_dir(shard_dir.parent().unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".incomplete"))
        .collect();
    assert!(leftovers.is_empty());

    // Completed layers stay for a retry.
    assert!(store.blobs().has(good.digest()).unwrap());
    assert!(!store.manifests().exists(&image.digest().unwrap()));
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_tag_fails_before_streaming() {
    let (_temp_dir, store) = open_store().await;
    let layer = gguf(b"weights");
    let image = TestImage::new("llama", vec![layer.clone()]);

    let err = store.write(&image, &tags(&["Not A Tag"]), None).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidReference { .. }));
    assert!(!store.blobs().has(layer.digest()).unwrap());
}

#[tokio::test]
async fn test_tag_moves_to_latest_model() {
    let (_temp_dir, store) = open_store().await;
    let a = store
        .write(&TestImage::new("llama", vec![gguf(b"a")]), &tags(&["x"]), None)
        .await
        .unwrap();
    let b = store
        .write(&TestImage::new("llama", vec![gguf(b"b")]), &[], None)
        .await
        .unwrap();

    store.add_tags(&b.to_string(), &tags(&["x"])).await.unwrap();

    assert_eq!(store.read("x").await.unwrap().id(), &b);
    assert_eq!(store.read("x:latest").await.unwrap().id(), &b);
    assert!(store.read(&a.to_string()).await.unwrap().tags().is_empty());
}

#[tokio::test]
async fn test_remove_tags_is_all_or_nothing() {
    let (_temp_dir, store) = open_store().await;
    let id = store
        .write(&TestImage::new("llama", vec![gguf(b"a")]), &tags(&["m:v1", "m:v2"]), None)
        .await
        .unwrap();

    let err = store.remove_tags(&tags(&["m:v1", "missing:v1"])).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(store.read("m:v1").await.unwrap().id(), &id);

    let removed = store.remove_tags(&tags(&["m:v1"])).await.unwrap();
    assert_eq!(removed, vec![id.clone()]);
    assert!(store.read("m:v1").await.unwrap_err().is_not_found());
    assert_eq!(store.read("m:v2").await.unwrap().id(), &id);
}

#[tokio::test]
async fn test_shared_blob_survives_until_last_delete() {
    let (_temp_dir, store) = open_store().await;
    let shared = gguf(b"shared weights");
    store
        .write(
            &TestImage::new("llama", vec![shared.clone(), gguf(b"a only")]),
            &tags(&["a"]),
            None,
        )
        .await
        .unwrap();
    store
        .write(&TestImage::new("qwen", vec![shared.clone()]), &tags(&["b"]), None)
        .await
        .unwrap();

    let outcome = store.delete("a").await.unwrap();
    assert!(outcome.warnings.is_empty());
    assert_eq!(outcome.tags, tags(&["a:latest"]));
    assert!(store.blobs().has(shared.digest()).unwrap());
    assert!(!store.blobs().has(&Digest::sha256_of(b"a only")).unwrap());

    store.delete("b").await.unwrap();
    assert!(!store.blobs().has(shared.digest()).unwrap());
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_reports_cleanup_failures() {
    let (_temp_dir, store) = open_store().await;
    let layer = gguf(b"weights");
    let id = store
        .write(&TestImage::new("llama", vec![layer.clone()]), &tags(&["m"]), None)
        .await
        .unwrap();
    fs::remove_file(store.blobs().path(layer.digest())).unwrap();

    let outcome = store.delete("m").await.unwrap();
    assert_eq!(outcome.id, id);
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].target.starts_with("blob "));
    assert!(store.list().await.unwrap().is_empty());

    assert!(store.delete("m").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_bundle_names_shards_in_order() {
    let (_temp_dir, store) = open_store().await;
    let shards = vec![gguf(b"shard one"), gguf(b"shard two"), gguf(b"shard three")];
    store
        .write(&TestImage::new("llama", shards), &tags(&["big"]), None)
        .await
        .unwrap();

    let bundle = store.bundle("big").await.unwrap();
    assert_eq!(
        file_names(bundle.root_dir()),
        vec![
            "config.json",
            "model-00001-of-00003.gguf",
            "model-00002-of-00003.gguf",
            "model-00003-of-00003.gguf",
        ]
    );
    assert_eq!(
        fs::read(bundle.root_dir().join("model-00003-of-00003.gguf")).unwrap(),
        b"shard three"
    );
    assert_eq!(
        bundle.gguf_path().unwrap(),
        bundle.root_dir().join("model-00001-of-00003.gguf")
    );
}

#[tokio::test]
async fn test_end_to_end_with_shared_config() {
    let (_temp_dir, store) = open_store().await;
    let image = TestImage::new("llama", vec![gguf(b"part one"), gguf(b"part two")]);
    let other = TestImage::new("llama", vec![gguf(b"other weights")]);
    assert_eq!(image.config_digest().unwrap(), other.config_digest().unwrap());

    store.write(&image, &tags(&["m:v1"]), None).await.unwrap();
    store.write(&other, &tags(&["other:v1"]), None).await.unwrap();

    let model = store.read("m:v1").await.unwrap();
    assert_eq!(model.id(), &Digest::sha256_of(&image.raw_manifest));
    assert_eq!(model.config().architecture, "llama");
    assert_eq!(model.gguf_paths().len(), 2);

    let bundle = store.bundle("m:v1").await.unwrap();
    assert_eq!(
        file_names(bundle.root_dir()),
        vec![
            "config.json",
            "model-00001-of-00002.gguf",
            "model-00002-of-00002.gguf",
        ]
    );

    let outcome = store.delete("m:v1").await.unwrap();
    assert!(outcome.warnings.is_empty());
    assert!(!store.manifests().exists(model.id()));
    assert!(!store.blobs().has(&Digest::sha256_of(b"part one")).unwrap());
    assert!(!store.blobs().has(&Digest::sha256_of(b"part two")).unwrap());
    assert!(store.blobs().has(&image.config_digest().unwrap()).unwrap());
    assert!(!bundle.root_dir().exists());
    assert!(store.read("other:v1").await.is_ok());
}

#[tokio::test]
async fn test_bundle_with_every_layer_kind() {
    let (_temp_dir, store) = open_store().await;
    let weights = gguf(b"REAL WEIGHTS CONTENT");
    let projector = layer(b"projector", MEDIA_TYPE_MMPROJ);
    let template = layer(b"{{ prompt }}", MEDIA_TYPE_CHAT_TEMPLATE);
    let archive = layer(
        &config_archive(&[
            ("tokenizer.json", b"{}"),
            ("generation_config.json", b"{\"top_p\":0.9}"),
        ]),
        MEDIA_TYPE_CONFIG_ARCHIVE,
    );
    let image = TestImage::new(
        "llava",
        vec![weights.clone(), projector.clone(), template.clone(), archive],
    );
    store.write(&image, &tags(&["m:v1"]), None).await.unwrap();

    let bundle = store.bundle("m:v1").await.unwrap();
    assert_eq!(
        file_names(bundle.root_dir()),
        vec![
            "config.json",
            "generation_config.json",
            "model.gguf",
            "model.mmproj",
            "template.jinja",
            "tokenizer.json",
        ]
    );
    assert_eq!(bundle.mmproj_path().unwrap(), bundle.root_dir().join("model.mmproj"));
    assert_eq!(fs::read(bundle.root_dir().join("tokenizer.json")).unwrap(), b"{}");
    for stored in [&weights, &projector, &template] {
        assert_blob_intact(&store, stored);
    }
}

#[tokio::test]
async fn test_config_archive_cannot_overwrite_bundle_files() {
    let (_temp_dir, store) = open_store().await;
    let weights = gguf(b"REAL WEIGHTS CONTENT");
    let template = layer(b"{{ prompt }}", MEDIA_TYPE_CHAT_TEMPLATE);
    let archive = layer(
        &config_archive(&[("model.gguf", b"x"), ("template.jinja", b"y")]),
        MEDIA_TYPE_CONFIG_ARCHIVE,
    );
    let image = TestImage::new("llama", vec![weights.clone(), template.clone(), archive]);
    let id = store.write(&image, &tags(&["m:v1"]), None).await.unwrap();

    let err = store.bundle("m:v1").await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));
    assert_blob_intact(&store, &weights);
    assert_blob_intact(&store, &template);

    // The partial bundle is not left behind.
    let bundle_dir = store.root().join("bundles").join("sha256").join(id.hex());
    assert!(!bundle_dir.exists());
}

#[tokio::test]
async fn test_bundle_of_deleted_model_is_not_found() {
    let (_temp_dir, store) = open_store().await;
    let id = store
        .write(&TestImage::new("llama", vec![gguf(b"w")]), &tags(&["m"]), None)
        .await
        .unwrap();

    let (bundled, deleted) = tokio::join!(store.bundle("m"), store.delete("m"));
    deleted.unwrap();
    if let Err(e) = bundled {
        assert!(e.is_not_found());
    }

    let bundle_dir = store.root().join("bundles").join("sha256").join(id.hex());
    assert!(!bundle_dir.exists());
    assert!(store.bundle("m").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_broken_bundle_is_regenerated() {
    let (_temp_dir, store) = open_store().await;
    let template: Arc<dyn ModelLayer> =
        Arc::new(BytesLayer::new(b"{{ prompt }}".to_vec(), MEDIA_TYPE_CHAT_TEMPLATE));
    store
        .write(
            &TestImage::new("llama", vec![gguf(b"weights"), template]),
            &tags(&["m"]),
            None,
        )
        .await
        .unwrap();

    let bundle = store.bundle("m").await.unwrap();
    assert!(bundle.chat_template_path().is_some());

    // A second template makes the bundle ambiguous.
    fs::write(bundle.root_dir().join("extra.jinja"), b"{{ x }}").unwrap();
    let rebuilt = store.bundle("m").await.unwrap();
    assert_eq!(rebuilt.root_dir(), bundle.root_dir());
    assert!(!bundle.root_dir().join("extra.jinja").exists());

    fs::remove_file(bundle.root_dir().join("config.json")).unwrap();
    let rebuilt = store.bundle("m").await.unwrap();
    assert_eq!(rebuilt.runtime_config().architecture, "llama");
    assert!(bundle.root_dir().join("config.json").is_file());
}

#[tokio::test]
async fn test_reset_keeps_root() {
    let (_temp_dir, store) = open_store().await;
    store
        .write(&TestImage::new("llama", vec![gguf(b"w")]), &tags(&["m"]), None)
        .await
        .unwrap();
    store.bundle("m").await.unwrap();
    fs::write(store.root().join("stray.txt"), b"x").unwrap();

    store.reset().await.unwrap();

    assert!(store.root().is_dir());
    assert_eq!(file_names(store.root()), vec!["index.json", "layout.json"]);
    assert!(store.list().await.unwrap().is_empty());
    assert_eq!(store.disk_usage().await.unwrap().total(), 0);
}

#[tokio::test]
async fn test_lightweight_write_reuses_stored_layers() {
    let temp_dir = TempDir::new().unwrap();
    let store = LocalStore::open(temp_dir.path().join("store")).await.unwrap();
    let weights = temp_dir.path().join("tiny.gguf");
    fs::write(&weights, b"tiny weights").unwrap();

    let image = ModelBuilder::from_gguf(&[weights]).unwrap().build().unwrap();
    let original = store.write(&image, &tags(&["tiny"]), None).await.unwrap();
    let model = store.read("tiny").await.unwrap();

    let repackaged = ModelBuilder::from_model(&model)
        .with_context_size(4096)
        .build()
        .unwrap();
    let id = store
        .write_lightweight(&repackaged, &tags(&["tiny:4k"]))
        .await
        .unwrap();
    assert_ne!(id, original);

    let updated = store.read("tiny:4k").await.unwrap();
    assert_eq!(updated.config().context_size, Some(4096));
    assert_eq!(updated.layers()[0].descriptor, model.layers()[0].descriptor);
    assert_eq!(store.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_write_reports_progress() {
    let (_temp_dir, store) = open_store().await;
    let buf = SharedBuf::default();
    let image = TestImage::new("llama", vec![gguf(b"0123456789"), gguf(b"abcde")]);

    store
        .write(&image, &[], Some(ProgressSink::new(buf.clone())))
        .await
        .unwrap();

    let output = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    let messages: Vec<Value> = output
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(!messages.is_empty());
    for message in &messages {
        assert_eq!(message["type"], "progress");
        assert_eq!(message["total"], 15);
    }
    assert!(messages
        .iter()
        .any(|m| m["layer"]["size"] == 10 && m["pulled"] == 10));
    assert!(messages
        .iter()
        .any(|m| m["layer"]["size"] == 5 && m["pulled"] == 5));
}

#[tokio::test]
async fn test_disk_usage_counts_blobs_and_manifests() {
    let (_temp_dir, store) = open_store().await;
    let image = TestImage::new("llama", vec![gguf(&[7u8; 4096])]);
    store.write(&image, &[], None).await.unwrap();

    let usage = store.disk_usage().await.unwrap();
    assert_eq!(usage.blobs, 4096 + image.raw_config.len() as u64);
    assert_eq!(usage.manifests, image.raw_manifest.len() as u64);
    assert_eq!(usage.bundles, 0);
}

#[tokio::test]
async fn test_open_refuses_newer_layout() {
    let temp_dir = TempDir::new().unwrap();
    let root: PathBuf = temp_dir.path().join("store");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("layout.json"), br#"{"version":"2.0.0"}"#).unwrap();

    let err = LocalStore::open(&root).await.unwrap_err();
    assert!(matches!(err, StoreError::IncompatibleLayout { .. }));
}
