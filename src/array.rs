use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use serde_yaml::{Mapping, Value};

use crate::{
    Error, Result,
    block::BlockHeader,
    dtype::{ByteOrder, DType, Element},
    storage::AsdfSource,
    tag,
};

/// A materialised n-dimensional array: raw element bytes plus their layout.
///
/// Cloning is cheap; clones share the same immutable buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    dtype: DType,
    byteorder: ByteOrder,
    shape: Vec<u64>,
    data: Bytes,
}

impl NdArray {
    pub fn new(dtype: DType, byteorder: ByteOrder, shape: Vec<u64>, data: Bytes) -> Result<Self> {
        let expected = byte_len(&dtype, &shape)?;
        if data.len() as u64 != expected {
            return Err(Error::general(format!(
                "{} bytes cannot hold a {dtype} array of shape {shape:?}",
                data.len()
            )));
        }
        Ok(Self {
            dtype,
            byteorder,
            shape,
            data,
        })
    }

    /// Build from elements in C order, stored in native byte order.
    pub fn from_vec<T: Element>(shape: Vec<u64>, values: Vec<T>) -> Result<Self> {
        let dtype = T::dtype();
        let size = dtype.size() as usize;
        let order = ByteOrder::native();
        let mut data = vec![0u8; values.len() * size];
        for (v, chunk) in values.into_iter().zip(data.chunks_exact_mut(size)) {
            v.write(chunk, order);
        }
        Self::new(dtype, order, shape, Bytes::from(data))
    }

    pub fn dtype(&self) -> &DType {
        &self.dtype
    }

    pub fn byteorder(&self) -> ByteOrder {
        self.byteorder
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product::<u64>() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The raw element bytes.
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    /// Whether both arrays view the same buffer.
    pub fn shares_buffer(&self, other: &NdArray) -> bool {
        self.data.as_ptr() == other.data.as_ptr() && self.data.len() == other.data.len()
    }

    /// Decode into a flat vector of `T`, which must match the datatype exactly.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::dtype() != self.dtype {
            return Err(Error::general(format!(
                "cannot read {} array as {}",
                self.dtype,
                T::dtype()
            )));
        }
        let size = self.dtype.size() as usize;
        Ok(self
            .data
            .chunks_exact(size)
            .map(|c| T::read(c, self.byteorder))
            .collect())
    }

    /// Decode any real numeric array into `f64`.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let size = self.dtype.size() as usize;
        self.data
            .chunks_exact(size)
            .map(|c| {
                self.dtype.read_f64(c, self.byteorder).ok_or_else(|| {
                    Error::Unsupported(format!("{} values as floating point", self.dtype))
                })
            })
            .collect()
    }

    pub fn to_ndarray<T: Element>(&self) -> Result<ndarray::ArrayD<T>> {
        let shape: Vec<usize> = self.shape.iter().map(|&n| n as usize).collect();
        ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&shape), self.to_vec()?)
            .map_err(Error::wrap)
    }

    /// A copy which owns a fresh buffer.
    pub fn deep_copy(&self) -> Self {
        Self {
            data: Bytes::copy_from_slice(&self.data),
            ..self.clone()
        }
    }
}

/// Blocks of one open file, shared by every array node that refers to them.
#[derive(Debug)]
pub(crate) struct Blocks {
    pub(crate) source: AsdfSource,
    pub(crate) headers: Vec<BlockHeader>,
}

impl Blocks {
    pub(crate) fn header(&self, index: i64) -> Result<&BlockHeader> {
        let len = self.headers.len() as i64;
        let i = if index < 0 { len + index } else { index };
        usize::try_from(i)
            .ok()
            .and_then(|i| self.headers.get(i))
            .ok_or_else(|| {
                Error::format(format!("array refers to block {index}, file has {len}"))
            })
    }

    fn payload(&self, index: i64) -> Result<Bytes> {
        self.header(index)?.read(&self.source)
    }
}

/// Where an array's bytes come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ArraySource {
    /// Index into the file's binary blocks; negative counts from the end.
    Block(i64),
    /// An external file, by relative URI.
    External(String),
    /// Held in memory: inline data, or set by the caller.
    Memory,
}

/// An array node whose payload is fetched on first access.
///
/// Shape and datatype are known from the tree alone.
#[derive(Debug)]
pub struct ArrayBlock {
    dtype: DType,
    byteorder: ByteOrder,
    shape: Vec<u64>,
    offset: u64,
    strides: Option<Vec<i64>>,
    source: ArraySource,
    blocks: Option<Arc<Blocks>>,
    cache: Mutex<Option<NdArray>>,
}

impl ArrayBlock {
    /// An in-memory array node.
    pub fn new(array: NdArray) -> Self {
        Self {
            dtype: array.dtype.clone(),
            byteorder: array.byteorder,
            shape: array.shape.clone(),
            offset: 0,
            strides: None,
            source: ArraySource::Memory,
            blocks: None,
            cache: Mutex::new(Some(array)),
        }
    }

    pub fn dtype(&self) -> &DType {
        &self.dtype
    }

    pub fn byteorder(&self) -> ByteOrder {
        self.byteorder
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn source(&self) -> &ArraySource {
        &self.source
    }

    /// Size of the materialised array in bytes.
    pub fn nbytes(&self) -> u64 {
        self.shape
            .iter()
            .fold(self.dtype.size(), |acc, &n| acc.saturating_mul(n))
    }

    pub fn is_materialized(&self) -> bool {
        self.lock().is_some()
    }

    /// Fetch the payload if needed and return it.
    ///
    /// The first successful call caches the array; later calls return the cached
    /// buffer without touching the store. A failed fetch caches nothing.
    pub fn materialize(&self) -> Result<NdArray> {
        let mut cache = self.lock();
        if let Some(array) = cache.as_ref() {
            return Ok(array.clone());
        }
        let array = self.fetch()?;
        *cache = Some(array.clone());
        Ok(array)
    }

    /// Replace the payload, turning this into an in-memory array.
    pub fn replace(&mut self, array: NdArray) {
        *self = Self::new(array);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<NdArray>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fetch(&self) -> Result<NdArray> {
        let index = match &self.source {
            ArraySource::Block(i) => *i,
            ArraySource::External(uri) => {
                return Err(Error::Unsupported(format!("external array source {uri:?}")));
            }
            ArraySource::Memory => {
                return Err(Error::general("in-memory array has no payload"));
            }
        };
        let blocks = self
            .blocks
            .as_ref()
            .ok_or_else(|| Error::general("array is not attached to a file"))?;
        let payload = blocks.payload(index)?;
        let data = self.select(payload)?;
        NdArray::new(self.dtype.clone(), self.byteorder, self.shape.clone(), data)
    }

    /// Apply offset and strides to a block payload, yielding contiguous C-order bytes.
    fn select(&self, payload: Bytes) -> Result<Bytes> {
        let size = self.dtype.size();
        let nbytes = byte_len(&self.dtype, &self.shape)?;
        let contiguous = c_strides(&self.shape, size)?;
        let strides = match &self.strides {
            Some(s) if *s != contiguous => s,
            _ => {
                let end = self
                    .offset
                    .checked_add(nbytes)
                    .ok_or_else(|| Error::format("array offset overflows"))?;
                if end > payload.len() as u64 {
                    return Err(Error::format(format!(
                        "array in block {:?} ends at byte {end}, block holds {}",
                        self.source,
                        payload.len()
                    )));
                }
                return Ok(payload.slice(self.offset as usize..end as usize));
            }
        };
        if strides.len() != self.shape.len() {
            return Err(Error::format("strides and shape differ in length"));
        }
        let size = size as usize;
        let count = self.shape.iter().product::<u64>();
        let offset = i64::try_from(self.offset)
            .map_err(|_| Error::format("array offset overflows"))?;
        let mut out = Vec::with_capacity((nbytes as usize).min(payload.len()));
        let mut index = vec![0u64; self.shape.len()];
        for _ in 0..count {
            let pos = index
                .iter()
                .zip(strides)
                .try_fold(offset, |acc, (&i, &s)| {
                    i64::try_from(i)
                        .ok()
                        .and_then(|i| i.checked_mul(s))
                        .and_then(|step| acc.checked_add(step))
                })
                .ok_or_else(|| Error::format("strided array position overflows"))?;
            let pos = usize::try_from(pos)
                .map_err(|_| Error::format("strided array reaches before its block"))?;
            let element = pos
                .checked_add(size)
                .and_then(|end| payload.get(pos..end))
                .ok_or_else(|| {
                    Error::format(format!(
                        "strided array in block {:?} reaches byte {pos}, block holds {}",
                        self.source,
                        payload.len()
                    ))
                })?;
            out.extend_from_slice(element);
            for (i, n) in index.iter_mut().zip(&self.shape).rev() {
                *i += 1;
                if *i < *n {
                    break;
                }
                *i = 0;
            }
        }
        Ok(Bytes::from(out))
    }

    /// Parse the body of a `core/ndarray` node.
    pub(crate) fn from_yaml(value: &Value, blocks: &Arc<Blocks>) -> Result<Self> {
        let map = match value {
            Value::Mapping(m) => m,
            Value::Sequence(_) => return Self::inline(value, None),
            other => return Err(Error::format(format!("invalid ndarray {other:?}"))),
        };
        let dtype = map.get("datatype").map(DType::from_yaml).transpose()?;
        if let Some(data) = map.get("data") {
            return Self::inline(data, dtype);
        }
        let dtype = dtype.ok_or_else(|| Error::format("ndarray without datatype"))?;
        let byteorder = match map.get("byteorder") {
            Some(v) => serde_yaml::from_value(v.clone())?,
            None => ByteOrder::default(),
        };
        let source = match map.get("source") {
            Some(Value::Number(n)) => ArraySource::Block(
                n.as_i64()
                    .ok_or_else(|| Error::format("block source must be an integer"))?,
            ),
            Some(Value::String(uri)) => ArraySource::External(uri.clone()),
            _ => return Err(Error::format("ndarray without source or data")),
        };
        let offset = map.get("offset").and_then(Value::as_u64).unwrap_or(0);
        let strides = match map.get("strides") {
            Some(v) => Some(serde_yaml::from_value::<Vec<i64>>(v.clone())?),
            None => None,
        };
        let raw_shape = map
            .get("shape")
            .and_then(Value::as_sequence)
            .ok_or_else(|| Error::format("ndarray without shape"))?;
        let mut streamed = false;
        let mut shape = Vec::with_capacity(raw_shape.len());
        for (i, dim) in raw_shape.iter().enumerate() {
            match dim {
                Value::String(s) if s == "*" && i == 0 => {
                    streamed = true;
                    shape.push(0);
                }
                other => shape.push(
                    other
                        .as_u64()
                        .ok_or_else(|| Error::format(format!("invalid dimension {other:?}")))?,
                ),
            }
        }
        if streamed {
            let ArraySource::Block(index) = source else {
                return Err(Error::format("only block arrays may be streamed"));
            };
            let row = byte_len(&dtype, &shape[1..])?;
            let data_size = blocks.header(index)?.data_size;
            shape[0] = if row == 0 { 0 } else { data_size.saturating_sub(offset) / row };
        }
        byte_len(&dtype, &shape)?;
        Ok(Self {
            dtype,
            byteorder,
            shape,
            offset,
            strides,
            source,
            blocks: Some(blocks.clone()),
            cache: Mutex::new(None),
        })
    }

    /// Arrays written directly into the tree as nested lists.
    fn inline(data: &Value, dtype: Option<DType>) -> Result<Self> {
        let mut shape = Vec::new();
        let mut cursor = data;
        while let Value::Sequence(seq) = cursor {
            shape.push(seq.len() as u64);
            match seq.first() {
                Some(first) => cursor = first,
                None => break,
            }
        }
        let mut numbers = Vec::new();
        flatten(data, shape.len(), &mut numbers)?;
        if numbers.len() as u64 != shape.iter().product::<u64>() {
            return Err(Error::format("ragged inline array"));
        }
        let dtype = dtype.unwrap_or_else(|| {
            if numbers.iter().all(|n| n.is_i64()) {
                DType::Int64
            } else {
                DType::Float64
            }
        });
        let array = match dtype {
            DType::Int8 => from_numbers::<i8>(shape, &numbers, |n| n.as_i64()?.try_into().ok()),
            DType::UInt8 => from_numbers::<u8>(shape, &numbers, |n| n.as_u64()?.try_into().ok()),
            DType::Int16 => from_numbers::<i16>(shape, &numbers, |n| n.as_i64()?.try_into().ok()),
            DType::UInt16 => {
                from_numbers::<u16>(shape, &numbers, |n| n.as_u64()?.try_into().ok())
            }
            DType::Int32 => from_numbers::<i32>(shape, &numbers, |n| n.as_i64()?.try_into().ok()),
            DType::UInt32 => {
                from_numbers::<u32>(shape, &numbers, |n| n.as_u64()?.try_into().ok())
            }
            DType::Int64 => from_numbers::<i64>(shape, &numbers, serde_yaml::Number::as_i64),
            DType::UInt64 => from_numbers::<u64>(shape, &numbers, serde_yaml::Number::as_u64),
            DType::Float32 => {
                from_numbers::<f32>(shape, &numbers, |n| n.as_f64().map(|v| v as f32))
            }
            DType::Float64 => from_numbers::<f64>(shape, &numbers, serde_yaml::Number::as_f64),
            other => Err(Error::Unsupported(format!("inline {other} array"))),
        }?;
        Ok(Self::new(array))
    }

    /// The `core/ndarray` body referring to block `index`, for writing.
    pub(crate) fn to_yaml(&self, index: usize) -> Value {
        let mut map = Mapping::new();
        map.insert("source".into(), (index as u64).into());
        map.insert("datatype".into(), self.dtype.to_yaml());
        map.insert("byteorder".into(), self.byteorder.as_str().into());
        map.insert(
            "shape".into(),
            Value::Sequence(self.shape.iter().map(|&n| n.into()).collect()),
        );
        Value::Tagged(Box::new(serde_yaml::value::TaggedValue {
            tag: tag::Tag::new(tag::NDARRAY, "1.0.0").to_yaml(),
            value: Value::Mapping(map),
        }))
    }
}

/// Copies share the read-only block source, but never the cached payload.
impl Clone for ArrayBlock {
    fn clone(&self) -> Self {
        Self {
            dtype: self.dtype.clone(),
            byteorder: self.byteorder,
            shape: self.shape.clone(),
            offset: self.offset,
            strides: self.strides.clone(),
            source: self.source.clone(),
            blocks: self.blocks.clone(),
            cache: Mutex::new(self.lock().as_ref().map(NdArray::deep_copy)),
        }
    }
}

/// Bytes needed for `shape` elements of `dtype`.
fn byte_len(dtype: &DType, shape: &[u64]) -> Result<u64> {
    if dtype.size() == 0 {
        return Err(Error::format(format!("zero-size datatype {dtype}")));
    }
    shape
        .iter()
        .try_fold(dtype.size(), |acc, &n| acc.checked_mul(n))
        .ok_or_else(|| Error::format(format!("{dtype} array of shape {shape:?} is too large")))
}

fn c_strides(shape: &[u64], size: u64) -> Result<Vec<i64>> {
    let mut out = vec![0i64; shape.len()];
    let mut acc = i64::try_from(size).ok();
    for (s, &n) in out.iter_mut().zip(shape).rev() {
        *s = acc.ok_or_else(|| Error::format("array strides overflow"))?;
        acc = acc.and_then(|a| a.checked_mul(i64::try_from(n).ok()?));
    }
    Ok(out)
}

fn flatten<'a>(value: &'a Value, depth: usize, out: &mut Vec<&'a serde_yaml::Number>) -> Result<()> {
    match (value, depth) {
        (Value::Number(n), 0) => out.push(n),
        (Value::Sequence(seq), d) if d > 0 => {
            for v in seq {
                flatten(v, d - 1, out)?;
            }
        }
        (other, _) => return Err(Error::format(format!("unexpected inline array element {other:?}"))),
    }
    Ok(())
}

fn from_numbers<T: Element>(
    shape: Vec<u64>,
    numbers: &[&serde_yaml::Number],
    convert: impl Fn(&serde_yaml::Number) -> Option<T>,
) -> Result<NdArray> {
    let values = numbers
        .iter()
        .map(|&n| convert(n).ok_or_else(|| Error::format(format!("{n} does not fit {}", T::dtype()))))
        .collect::<Result<Vec<_>>>()?;
    NdArray::from_vec(shape, values)
}
