use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use zarrs::storage::byte_range::{ByteRange, ByteRangeIterator};
use zarrs::storage::store::MemoryStore;
use zarrs::storage::{
    MaybeBytes, MaybeBytesIterator, ReadableStorageTraits, StorageError, StoreKey,
    WritableStorageTraits,
};
use zarrs_asdf::{
    AsdfFile, Compression, DType, Error, Magnitude, NdArray, Node, OpenOptions, Quantity,
    SchemaRegistry, Tag, TimeScale, TimeUnit, TimeValue, Tree, Unit, WriteOptions,
};

const KEY: &str = "products/image.asdf";

/// Wraps a store, counting reads and failing those past a given offset.
struct CountingStore<R> {
    inner: R,
    reads: AtomicUsize,
    fail_from: AtomicU64,
}

impl<R> CountingStore<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
            fail_from: AtomicU64::new(u64::MAX),
        }
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn fail_from(&self, offset: u64) {
        self.fail_from.store(offset, Ordering::SeqCst);
    }
}

impl<R: ReadableStorageTraits> ReadableStorageTraits for CountingStore<R> {
    fn size_key(&self, key: &StoreKey) -> Result<Option<u64>, StorageError> {
        self.inner.size_key(key)
    }

    fn supports_get_partial(&self) -> bool {
        self.inner.supports_get_partial()
    }

    fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_from.load(Ordering::SeqCst) != u64::MAX {
            return Err(std::io::Error::other("simulated outage").into());
        }
        self.inner.get(key)
    }

    fn get_partial_many<'a>(
        &'a self,
        key: &StoreKey,
        byte_ranges: ByteRangeIterator<'a>,
    ) -> Result<MaybeBytesIterator<'a>, StorageError> {
        self.inner.get_partial_many(key, byte_ranges)
    }

    fn get_partial(&self, key: &StoreKey, byte_range: ByteRange) -> Result<MaybeBytes, StorageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let ByteRange::FromStart(offset, _) = byte_range {
            if offset >= self.fail_from.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("simulated outage").into());
            }
        }
        self.inner.get_partial(key, byte_range)
    }
}

fn time(iso: &str) -> TimeValue {
    TimeValue::from_iso(iso, TimeScale::Utc).expect("valid time")
}

fn image_tree() -> Tree {
    let data: Vec<f32> = (0..12).map(|i| i as f32 * 0.5).collect();
    let dq: Vec<u32> = vec![0, 1, 0, 0, 2, 0, 0, 0, 0, 4, 0, 0];
    let per_second = Unit::parse("DN / s").expect("valid unit");
    let quantity = |values: Vec<f32>| {
        Node::quantity(Quantity::new(
            Magnitude::Array(NdArray::from_vec(vec![3, 4], values).expect("valid array")),
            per_second.clone(),
        ))
    };
    let meta = Node::group(
        None,
        [
            (
                "exposure",
                Node::group(
                    None,
                    [
                        ("start_time", Node::time(time("2027-01-01T00:00:00.000"))),
                        ("end_time", Node::time(time("2027-01-01T00:02:19.500"))),
                    ],
                ),
            ),
            (
                "instrument",
                Node::group(
                    None,
                    [
                        ("detector", Node::scalar("WFI01")),
                        ("optical_element", Node::scalar("F158")),
                    ],
                ),
            ),
            (
                "aperture",
                Node::group(
                    None,
                    [
                        ("name", Node::scalar("WFI_CEN")),
                        ("position_angle", Node::scalar(120.0)),
                    ],
                ),
            ),
            (
                "wcs",
                Node::group(
                    Some(Tag::parse("tag:stsci.edu:gwcs/wcs-1.2.0")),
                    [
                        ("name", Node::scalar("")),
                        (
                            "steps",
                            Node::sequence(vec![
                                Node::group(None, [("frame", Node::scalar("detector"))]),
                                Node::group(None, [("frame", Node::scalar("world"))]),
                            ]),
                        ),
                    ],
                ),
            ),
        ],
    );
    let roman = Node::group(
        Some(Tag::parse(
            "asdf://stsci.edu/datamodels/roman/tags/wfi_image-1.0.0",
        )),
        [
            ("data", quantity(data)),
            ("dq", Node::from_array(NdArray::from_vec(vec![3, 4], dq).expect("valid array"))),
            ("err", quantity(vec![0.1; 12])),
            ("meta", meta),
        ],
    );
    Tree::new(Node::group(None, [("roman", roman)]))
}

fn memory_store(bytes: Vec<u8>) -> Arc<CountingStore<MemoryStore>> {
    env_logger::try_init().ok();
    let store = MemoryStore::new();
    store
        .set(&StoreKey::new(KEY).expect("valid key"), bytes.into())
        .expect("memory store accepts writes");
    Arc::new(CountingStore::new(store))
}

fn image_store() -> Arc<CountingStore<MemoryStore>> {
    let bytes = image_tree()
        .to_bytes(&WriteOptions::default())
        .expect("tree should serialise");
    memory_store(bytes)
}

fn open(store: &Arc<CountingStore<MemoryStore>>, options: OpenOptions) -> AsdfFile {
    AsdfFile::open(store.clone(), KEY, options).expect("file should open")
}

#[test]
fn keys_match_the_written_tree() {
    let store = image_store();
    let f = open(&store, OpenOptions::default());
    assert_eq!(f.keys().unwrap(), vec!["roman"]);
    assert_eq!(f["roman"].keys().unwrap(), vec!["data", "dq", "err", "meta"]);
    assert_eq!(
        f.meta().unwrap().keys().unwrap(),
        vec!["aperture", "exposure", "instrument", "wcs"]
    );
    assert_eq!(f.file_version(), "1.0.0");
}

#[test]
fn lazy_open_reads_no_payloads() {
    let store = image_store();
    let f = open(&store, OpenOptions::default());
    let after_open = store.reads();

    let data = f.path("roman.data").unwrap();
    assert_eq!(data.shape(), Some(&[3, 4][..]));
    assert_eq!(data.dtype(), Some(&DType::Float32));
    assert_eq!(f["roman"]["dq"].dtype(), Some(&DType::UInt32));
    assert!(!data.is_materialized());

    let info = f.info(&Default::default());
    assert!(info.contains("dq (ArrayBlock) shape [3, 4], uint32 [lazy]"), "{info}");
    assert_eq!(f.search("time"), vec!["roman.meta.exposure.end_time", "roman.meta.exposure.start_time"]);
    assert_eq!(store.reads(), after_open);
}

#[test]
fn materialising_twice_fetches_once() {
    let store = image_store();
    let f = open(&store, OpenOptions::default());
    let before = store.reads();

    let first = f.path("roman.dq").unwrap().array().unwrap();
    assert_eq!(store.reads(), before + 1);
    let second = f["roman"].get("dq").unwrap().into_array().unwrap();
    assert_eq!(store.reads(), before + 1);
    assert_eq!(first, second);
    assert!(first.shares_buffer(&second));
    assert_eq!(first.to_vec::<u32>().unwrap()[9], 4);
    assert!(f.path("roman.dq").unwrap().is_materialized());
}

#[test]
fn concurrent_first_access_fetches_once() {
    let store = image_store();
    let f = open(&store, OpenOptions::default());
    let before = store.reads();
    let node = f.path("roman.err").unwrap();

    let arrays: Vec<NdArray> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8).map(|_| s.spawn(|| node.array().unwrap())).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(store.reads(), before + 1);
    assert!(arrays.windows(2).all(|w| w[0].shares_buffer(&w[1])));
}

#[test]
fn eager_open_materialises_every_array() {
    let dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join("zarrs_asdf");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("eager.asdf");
    let file = std::fs::File::create(&path).unwrap();
    image_tree()
        .write_to(file, &WriteOptions::new().compression(Compression::Zlib))
        .unwrap();

    let f = AsdfFile::open_path(&path, OpenOptions::new().lazy(false)).unwrap();
    let mut arrays = 0;
    f.walk(&mut |path, node| {
        if node.array_block().is_ok() {
            assert!(node.is_materialized(), "{path} was not loaded");
            arrays += 1;
        }
    });
    assert_eq!(arrays, 3);
}

#[test]
fn missing_keys_leave_other_nodes_alone() {
    let store = image_store();
    let f = open(&store, OpenOptions::default());
    f.path("roman.dq").unwrap().array().unwrap();

    let err = f["roman"].child("sci").unwrap_err();
    assert!(err.is_key_error());
    assert!(matches!(err, Error::KeyNotFound { ref key, .. } if key == "sci"));
    assert!(f.path("roman.meta.aperture.nope").unwrap_err().is_key_error());
    assert!(f.path("roman.meta.wcs.steps.7").unwrap_err().is_key_error());
    assert!(f.path("roman.meta.aperture.name").unwrap().keys().unwrap_err().is_type_error());

    assert!(f.path("roman.dq").unwrap().is_materialized());
    assert!(!f.path("roman.data").unwrap().is_materialized());
    assert!(!f.path("roman.err").unwrap().is_materialized());
}

#[test]
fn copies_are_deep_and_keep_quantities() {
    let store = image_store();
    let f = open(&store, OpenOptions::default());
    let original = f.path("roman.data").unwrap();
    original.array().unwrap();

    let mut copy = f.copy();
    let copied = copy.path("roman.data").unwrap();
    assert!(copied.is_materialized());
    let (a, b) = (original.to_quantity().unwrap(), copied.to_quantity().unwrap());
    assert_eq!(a.unit, b.unit);
    assert_eq!(a.value, b.value);
    let (Magnitude::Array(x), Magnitude::Array(y)) = (&a.value, &b.value) else {
        panic!("expected array quantities");
    };
    assert!(!x.shares_buffer(y));

    // still fetchable from the shared source
    assert!(!copy.path("roman.dq").unwrap().is_materialized());
    copy.path("roman.dq").unwrap().array().unwrap();
    assert!(!f.path("roman.dq").unwrap().is_materialized());

    copy.root_mut()
        .path_mut("roman.dq")
        .unwrap()
        .array_block_mut()
        .unwrap()
        .replace(NdArray::from_vec(vec![1], vec![7u32]).unwrap());
    copy.root_mut()
        .path_mut("roman.meta.aperture")
        .unwrap()
        .as_group_mut()
        .unwrap()
        .insert("name", Node::scalar("WFI_ALT"));
    assert_eq!(f.path("roman.dq").unwrap().shape(), Some(&[3, 4][..]));
    assert_eq!(f.path("roman.meta.aperture.name").unwrap().as_str(), Some("WFI_CEN"));
    assert_eq!(copy.path("roman.meta.aperture.name").unwrap().as_str(), Some("WFI_ALT"));
}

#[test]
fn exposure_duration_in_any_unit() {
    let store = image_store();
    let f = open(&store, OpenOptions::default());
    let exposure = f.meta().unwrap().child("exposure").unwrap();
    let start = exposure["start_time"].as_time().unwrap();
    let end = exposure["end_time"].as_time().unwrap();
    assert!(start < end);

    let elapsed = end.try_sub(start).unwrap();
    assert!((elapsed.to(TimeUnit::Seconds) - 139.5).abs() < 1e-6);
    assert!((elapsed.to(TimeUnit::Seconds) - elapsed.to(TimeUnit::Days) * 86400.0).abs() < 1e-6);
    let minutes = elapsed.to_quantity(TimeUnit::Minutes).unwrap();
    assert!((minutes.to(&Unit::parse("s").unwrap()).unwrap().as_f64().unwrap() - 139.5).abs() < 1e-6);
}

#[test]
fn quantity_units_are_checked() {
    let store = image_store();
    let f = open(&store, OpenOptions::default());
    let data = f.path("roman.data").unwrap().to_quantity().unwrap();
    let doubled = data.try_add(&data).unwrap();
    assert_eq!(doubled.unit, Unit::parse("DN/s").unwrap());
    let counts = Quantity::scalar(1.0, Unit::parse("DN").unwrap());
    assert!(matches!(
        data.try_add(&counts),
        Err(Error::IncompatibleUnits { .. })
    ));
}

#[test]
fn wcs_is_surfaced_as_stored() {
    let store = image_store();
    let f = open(&store, OpenOptions::default());
    let wcs = f.wcs().unwrap();
    assert_eq!(wcs.tag().unwrap().name(), "gwcs/wcs");
    assert_eq!(wcs.path("steps.1.frame").unwrap().as_str(), Some("world"));
}

#[test]
fn failed_fetches_are_isolated_and_retried() {
    let bytes = image_tree().to_bytes(&WriteOptions::default()).unwrap();
    let magic: Vec<usize> = bytes
        .windows(4)
        .enumerate()
        .filter_map(|(i, w)| (w == b"\xd3BLK").then_some(i))
        .collect();
    // blocks follow key order: data, dq, err
    assert_eq!(magic.len(), 3);
    let store = memory_store(bytes);
    let f = open(&store, OpenOptions::default());

    store.fail_from(magic[1] as u64);
    let err = f.path("roman.dq").unwrap().array().unwrap_err();
    assert!(err.is_transport_error(), "{err}");
    assert!(!f.path("roman.dq").unwrap().is_materialized());
    assert!(f.path("roman.data").unwrap().array().is_ok());

    store.fail_from(u64::MAX);
    assert!(f.path("roman.dq").unwrap().array().is_ok());
    assert!(f.path("roman.dq").unwrap().is_materialized());
}

#[test]
fn corrupt_blocks_are_format_errors() {
    let options = WriteOptions::new().compression(Compression::Zlib);
    let mut bytes = image_tree().to_bytes(&options).unwrap();
    let first = bytes.windows(4).position(|w| w == b"\xd3BLK").unwrap();
    let payload = first + 6 + 48;
    for b in &mut bytes[payload + 4..payload + 10] {
        *b ^= 0xff;
    }
    let store = memory_store(bytes);
    let f = open(&store, OpenOptions::default());

    let err = f.path("roman.data").unwrap().array().unwrap_err();
    assert!(err.is_format_error(), "{err}");
    assert!(!err.is_transport_error());
    assert!(!f.path("roman.data").unwrap().is_materialized());
    assert!(f.path("roman.dq").unwrap().array().is_ok());
}

#[test]
fn open_fails_when_the_store_does() {
    let store = image_store();
    store.fail_from(0);
    let err = AsdfFile::open(store.clone(), KEY, OpenOptions::default()).unwrap_err();
    assert!(err.is_transport_error(), "{err}");

    let missing = AsdfFile::open(store, "nowhere.asdf", OpenOptions::default()).unwrap_err();
    assert!(missing.is_transport_error(), "{missing}");
}

#[test]
fn validated_files_carry_schemas() {
    let store = image_store();
    let registry = Arc::new(SchemaRegistry::builtin().unwrap());
    let f = open(&store, OpenOptions::new().validator(registry));

    let found = f.schema_match().unwrap();
    assert_eq!(found.schema.title, "calibrated image");
    assert_eq!(found.path, "roman");
    let data = f.path("roman.data").unwrap().schema().unwrap();
    assert_eq!(data.dtype.as_deref(), Some("float32"));
    assert_eq!(data.unit.as_deref(), Some("DN / s"));
    assert!(f.path("roman.meta.exposure.start_time").unwrap().schema().is_some());
    assert!(f.path("roman.meta.wcs").unwrap().schema().is_none());
}

#[test]
fn nonconforming_files_fail_validation() {
    let mut tree = image_tree();
    tree.root_mut()
        .path_mut("roman")
        .unwrap()
        .as_group_mut()
        .unwrap()
        .remove("err");
    let store = memory_store(tree.to_bytes(&WriteOptions::default()).unwrap());
    let registry = Arc::new(SchemaRegistry::builtin().unwrap());

    let err = AsdfFile::open(store.clone(), KEY, OpenOptions::new().validator(registry)).unwrap_err();
    let Error::Validation { schema, failures } = err else {
        panic!("expected a validation error, got {err}");
    };
    assert_eq!(schema, "wfi_image");
    assert_eq!(failures, vec!["roman: missing required field err".to_owned()]);

    // the same file still opens without validation
    let f = open(&store, OpenOptions::default());
    assert_eq!(f["roman"].keys().unwrap(), vec!["data", "dq", "meta"]);
}

const FULL_FRAME: &str = "\
#ASDF 1.0.0
#ASDF_STANDARD 1.5.0
%YAML 1.1
%TAG ! tag:stsci.edu:asdf/
--- !core/asdf-1.1.0
roman: !<asdf://stsci.edu/datamodels/roman/tags/wfi_image-1.0.0>
  data: !unit/quantity-1.1.0
    value: !core/ndarray-1.0.0
      source: 0
      datatype: float32
      byteorder: big
      shape: [4088, 4088]
    unit: !unit/unit-1.0.0 DN / s
  dq: !core/ndarray-1.0.0
    source: 1
    datatype: int32
    byteorder: big
    shape: [4088, 4088]
  meta:
    aperture:
      name: WFI_CEN
      position_angle: 120.0
...
";

#[test]
fn full_frame_structure_without_payloads() {
    let store = memory_store(FULL_FRAME.as_bytes().to_vec());
    let f = open(&store, OpenOptions::default());
    let after_open = store.reads();

    let roman = &f["roman"];
    assert_eq!(roman.keys().unwrap(), vec!["data", "dq", "meta"]);
    assert_eq!(
        roman["meta"]["aperture"].keys().unwrap(),
        vec!["name", "position_angle"]
    );
    assert_eq!(roman["data"].shape(), Some(&[4088, 4088][..]));
    assert_eq!(roman["data"].dtype(), Some(&DType::Float32));
    assert_eq!(roman["data"].unit(), Some(&Unit::parse("DN/s").unwrap()));
    assert_eq!(roman["dq"].dtype(), Some(&DType::Int32));
    assert!(!roman["data"].is_materialized());
    assert!(!roman["dq"].is_materialized());
    assert_eq!(store.reads(), after_open);

    // the file has no blocks, so the payload cannot be fetched
    assert!(roman["dq"].array().unwrap_err().is_format_error());
    assert!(!roman["dq"].is_materialized());
}

#[test]
fn not_asdf() {
    let store = memory_store(b"SIMPLE  =                    T".to_vec());
    let err = AsdfFile::open(store, KEY, OpenOptions::default()).unwrap_err();
    assert!(err.is_format_error());
}
