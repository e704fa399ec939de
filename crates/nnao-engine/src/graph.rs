//! Serialized computation graphs.
//!
//! Two encodings exist, picked by an explicit mode flag. The text encoding
//! is JSON. The binary encoding is a compact little-endian layout:
//!
//! ```text
//! magic "NNGB" | u16 version | u32 node count | node*
//! node  = str name | str op | u32 n | str input * n | u32 m | (str key, f32 value) * m
//! str   = u32 byte length | utf-8 bytes
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::status::EngineStatus;

const BINARY_MAGIC: &[u8; 4] = b"NNGB";
const BINARY_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum GraphEncoding {
    Binary = 0,
    Text = 1,
}

impl GraphEncoding {
    /// Decode the mode flag; unknown values give `None`.
    pub fn from_mode(mode: u32) -> Option<Self> {
        Self::from_u32(mode)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub op: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub attrs: BTreeMap<String, f32>,
}

impl NodeDef {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: op.into(),
            ..Self::default()
        }
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    pub fn attr(mut self, key: impl Into<String>, value: f32) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphDef {
    pub nodes: Vec<NodeDef>,
}

impl GraphDef {
    pub fn new(nodes: Vec<NodeDef>) -> Self {
        Self { nodes }
    }

    pub fn read(path: &Path, encoding: GraphEncoding) -> Result<Self, EngineStatus> {
        let bytes = std::fs::read(path).map_err(|err| {
            EngineStatus::not_found(format!("{}; {err}", path.display()))
        })?;
        let graph = match encoding {
            GraphEncoding::Text => Self::from_text(&bytes),
            GraphEncoding::Binary => Self::from_binary(&bytes),
        }?;
        tracing::debug!(path = %path.display(), ?encoding, nodes = graph.nodes.len(), "graph read");
        Ok(graph)
    }

    pub fn write(&self, path: &Path, encoding: GraphEncoding) -> Result<(), EngineStatus> {
        let bytes = match encoding {
            GraphEncoding::Text => self.to_text()?.into_bytes(),
            GraphEncoding::Binary => self.to_binary(),
        };
        std::fs::write(path, bytes)
            .map_err(|err| EngineStatus::internal(format!("{}; {err}", path.display())))
    }

    pub fn from_text(bytes: &[u8]) -> Result<Self, EngineStatus> {
        serde_json::from_slice(bytes).map_err(|err| {
            EngineStatus::invalid_argument(format!("Can't parse graph as text: {err}"))
        })
    }

    pub fn to_text(&self) -> Result<String, EngineStatus> {
        serde_json::to_string_pretty(self).map_err(|err| EngineStatus::internal(err.to_string()))
    }

    pub fn to_binary(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(BINARY_MAGIC);
        out.extend_from_slice(&BINARY_VERSION.to_le_bytes());
        put_u32(&mut out, self.nodes.len());
        for node in &self.nodes {
            put_str(&mut out, &node.name);
            put_str(&mut out, &node.op);
            put_u32(&mut out, node.inputs.len());
            for input in &node.inputs {
                put_str(&mut out, input);
            }
            put_u32(&mut out, node.attrs.len());
            for (key, value) in &node.attrs {
                put_str(&mut out, key);
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        out
    }

    pub fn from_binary(bytes: &[u8]) -> Result<Self, EngineStatus> {
        let mut reader = Reader { bytes, pos: 0 };
        if reader.take(4)? != BINARY_MAGIC {
            return Err(EngineStatus::data_loss(
                "Can't parse graph as binary: bad magic",
            ));
        }
        let version = u16::from_le_bytes(reader.array()?);
        if version != BINARY_VERSION {
            return Err(EngineStatus::data_loss(format!(
                "Can't parse graph as binary: unsupported version {version}"
            )));
        }

        let count = reader.u32()?;
        let mut nodes = Vec::new();
        for _ in 0..count {
            let name = reader.string()?;
            let op = reader.string()?;
            let inputs = (0..reader.u32()?)
                .map(|_| reader.string())
                .collect::<Result<Vec<_>, _>>()?;
            let mut attrs = BTreeMap::new();
            for _ in 0..reader.u32()? {
                let key = reader.string()?;
                attrs.insert(key, f32::from_le_bytes(reader.array()?));
            }
            nodes.push(NodeDef {
                name,
                op,
                inputs,
                attrs,
            });
        }
        if reader.pos != bytes.len() {
            return Err(EngineStatus::data_loss(format!(
                "Can't parse graph as binary: {} trailing bytes",
                bytes.len() - reader.pos
            )));
        }
        Ok(Self { nodes })
    }
}

fn put_u32(out: &mut Vec<u8>, value: usize) {
    out.extend_from_slice(&(value as u32).to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    put_u32(out, value.len());
    out.extend_from_slice(value.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], EngineStatus> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                EngineStatus::data_loss(format!(
                    "Can't parse graph as binary: truncated at byte {}",
                    self.pos
                ))
            })?;
        let bytes = self.bytes;
        let slice = &bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], EngineStatus> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, EngineStatus> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String, EngineStatus> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| {
            EngineStatus::data_loss("Can't parse graph as binary: name is not utf-8")
        })
    }
}
