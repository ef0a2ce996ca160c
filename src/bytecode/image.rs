//! Portable bytecode images.
//!
//! A compiled script is exported as a tree of [`FunctionImage`]s whose
//! constant pools hold only literals and nested functions, then encoded with
//! postcard behind a fixed `YSPL` magic and a format version.

use serde::{Deserialize, Serialize};

use crate::bytecode::ir::{Bytecode, LineRun, LineTable};
use crate::lang::object::{Obj, ObjRef};
use crate::lang::value::Value;
use crate::runtime::heap::{Collector, NoRoots};

pub const MAGIC: [u8; 4] = *b"YSPL";
pub const VERSION: u16 = 1;

/// File extension of encoded images.
pub const EXTENSION: &str = "ybc";

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("not a yaspl bytecode image")]
    BadMagic,

    #[error("unsupported image version {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },

    #[error("cannot export constant of type {0}")]
    UnsupportedConstant(&'static str),

    #[error("not a function")]
    NotAFunction,

    #[error("malformed image: {0}")]
    Encoding(#[from] postcard::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ImageHeader {
    magic: [u8; 4],
    version: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    magic: [u8; 4],
    version: u16,
    pub script: FunctionImage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionImage {
    pub name: Option<String>,
    pub arity: u8,
    pub upvalue_count: u32,
    pub code: Vec<u8>,
    pub lines: Vec<LineRun>,
    pub constants: Vec<ConstantImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstantImage {
    Nihl,
    Bool(bool),
    Number(f64),
    String(Vec<u8>),
    Function(Box<FunctionImage>),
}

impl Image {
    pub fn new(script: FunctionImage) -> Self {
        Image {
            magic: MAGIC,
            version: VERSION,
            script,
        }
    }

    fn validate(magic: [u8; 4], version: u16) -> Result<(), ImageError> {
        if magic != MAGIC {
            return Err(ImageError::BadMagic);
        }
        if version != VERSION {
            return Err(ImageError::UnsupportedVersion {
                found: version,
                expected: VERSION,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Heap -> image
// =============================================================================

pub fn export(heap: &Collector, function: ObjRef) -> Result<Image, ImageError> {
    Ok(Image::new(export_function(heap, function)?))
}

fn export_function(heap: &Collector, function: ObjRef) -> Result<FunctionImage, ImageError> {
    let f = heap.as_function(function).ok_or(ImageError::NotAFunction)?;

    let constants = f
        .bytecode
        .constants
        .iter()
        .map(|&constant| export_constant(heap, constant))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(FunctionImage {
        name: f.name.map(|n| heap.string_lossy(n).into_owned()),
        arity: f.arity,
        upvalue_count: f.upvalue_count as u32,
        code: f.bytecode.code.clone(),
        lines: f.bytecode.lines.runs().to_vec(),
        constants,
    })
}

fn export_constant(heap: &Collector, value: Value) -> Result<ConstantImage, ImageError> {
    let r = match value {
        Value::Nihl => return Ok(ConstantImage::Nihl),
        Value::Bool(b) => return Ok(ConstantImage::Bool(b)),
        Value::Number(n) => return Ok(ConstantImage::Number(n)),
        Value::Obj(r) => r,
    };
    match heap.get(r) {
        Obj::String(s) => Ok(ConstantImage::String(s.bytes.to_vec())),
        Obj::Function(_) => Ok(ConstantImage::Function(Box::new(export_function(heap, r)?))),
        _ => Err(ImageError::UnsupportedConstant(heap.type_name(value))),
    }
}

// =============================================================================
// Image -> heap
// =============================================================================

/// Rebuilds the function tree in `heap` and returns the script function.
///
/// Meant to run before any VM owns the heap: nothing outside the image is
/// treated as a root. The result is unrooted, like a freshly compiled
/// script.
pub fn load(heap: &mut Collector, image: &Image) -> Result<ObjRef, ImageError> {
    Image::validate(image.magic, image.version)?;
    let depth = heap.safe_depth();
    let function = load_function(heap, &image.script);
    heap.truncate_safe(depth);
    Ok(function)
}

fn load_function(heap: &mut Collector, image: &FunctionImage) -> ObjRef {
    let function = heap.new_function(image.name.as_deref(), image.arity, &NoRoots);
    heap.push_safe(Value::Obj(function));
    let pinned = heap.safe_depth();

    let mut constants = Vec::with_capacity(image.constants.len());
    for constant in &image.constants {
        let value = match constant {
            ConstantImage::Nihl => Value::Nihl,
            ConstantImage::Bool(b) => Value::Bool(*b),
            ConstantImage::Number(n) => Value::Number(*n),
            ConstantImage::String(bytes) => Value::Obj(heap.intern(bytes, &NoRoots)),
            ConstantImage::Function(nested) => Value::Obj(load_function(heap, nested)),
        };
        if let Value::Obj(_) = value {
            heap.push_safe(value);
        }
        constants.push(value);
    }

    if let Some(f) = heap.as_function_mut(function) {
        f.upvalue_count = image.upvalue_count as usize;
        f.bytecode = Bytecode {
            code: image.code.clone(),
            constants,
            lines: LineTable::from_runs(image.lines.clone()),
        };
    }
    heap.track_growth(function, &NoRoots);
    // constants are reachable through the function now
    heap.truncate_safe(pinned);
    function
}

// =============================================================================
// Encoding
// =============================================================================

pub fn to_bytes(image: &Image) -> Result<Vec<u8>, ImageError> {
    Ok(postcard::to_allocvec(image)?)
}

pub fn from_bytes(bytes: &[u8]) -> Result<Image, ImageError> {
    let (header, _) =
        postcard::take_from_bytes::<ImageHeader>(bytes).map_err(|_| ImageError::BadMagic)?;
    Image::validate(header.magic, header.version)?;
    Ok(postcard::from_bytes(bytes)?)
}

/// Exports and encodes in one step.
pub fn write_image(heap: &Collector, function: ObjRef) -> Result<Vec<u8>, ImageError> {
    to_bytes(&export(heap, function)?)
}

/// Decodes and loads in one step.
pub fn read_image(heap: &mut Collector, bytes: &[u8]) -> Result<ObjRef, ImageError> {
    let image = from_bytes(bytes)?;
    load(heap, &image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::compile;
    use crate::bytecode::disasm::disassemble;
    use crate::runtime::heap::GcConfig;
    use crate::runtime::vm::Vm;
    use pretty_assertions::assert_eq;

    const PROGRAM: &str = "\
func counter()
    let n = 0
    func inc()
        n = n + 1
        ret n
    ret inc
let c = counter()
c()
print [c(), \"two\", true, nihl]
";

    fn run(heap: &mut Collector, function: ObjRef) -> String {
        let mut out = Vec::new();
        {
            let mut vm = Vm::new(heap).with_output(&mut out);
            vm.interpret(function).expect("program should run");
        }
        String::from_utf8(out).expect("utf8 output")
    }

    #[test]
    fn test_image_reloads_into_fresh_heap_and_runs() {
        let mut heap = Collector::new();
        let script = compile(PROGRAM, &mut heap).expect("compiles");
        let bytes = write_image(&heap, script).expect("exports");
        assert_eq!(&bytes[..4], b"YSPL");

        let mut fresh = Collector::with_config(GcConfig {
            stress: true,
            ..GcConfig::default()
        });
        let loaded = read_image(&mut fresh, &bytes).expect("loads");
        assert_eq!(fresh.safe_depth(), 0);
        assert_eq!(disassemble(&fresh, loaded), disassemble(&heap, script));
        assert_eq!(run(&mut fresh, loaded), "[2, two, true, nihl]\n");
    }

    #[test]
    fn test_export_keeps_function_metadata() {
        let mut heap = Collector::new();
        let script = compile(PROGRAM, &mut heap).expect("compiles");
        let image = export(&heap, script).expect("exports");

        assert_eq!(image.script.name, None);
        let ConstantImage::Function(counter) = &image.script.constants[1] else {
            panic!("expected function constant, got {:?}", image.script.constants[1]);
        };
        assert_eq!(counter.name.as_deref(), Some("counter"));
        let inc = counter
            .constants
            .iter()
            .find_map(|c| match c {
                ConstantImage::Function(f) => Some(f),
                _ => None,
            })
            .expect("inc is nested in counter");
        assert_eq!(inc.upvalue_count, 1);
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut heap = Collector::new();
        let err = read_image(&mut heap, b"NOPE\x01\x00").expect_err("bad magic");
        assert!(matches!(err, ImageError::BadMagic));
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let mut image = Image::new(FunctionImage {
            name: None,
            arity: 0,
            upvalue_count: 0,
            code: vec![],
            lines: vec![],
            constants: vec![],
        });
        image.version = VERSION + 1;
        let bytes = to_bytes(&image).expect("encodes");

        let err = from_bytes(&bytes).expect_err("future version");
        assert_eq!(
            err.to_string(),
            format!("unsupported image version {} (expected {})", VERSION + 1, VERSION)
        );
    }

    #[test]
    fn test_truncated_body_is_an_encoding_error() {
        let mut heap = Collector::new();
        let script = compile(PROGRAM, &mut heap).expect("compiles");
        let bytes = write_image(&heap, script).expect("exports");

        let err = from_bytes(&bytes[..bytes.len() / 2]).expect_err("truncated");
        assert!(matches!(err, ImageError::Encoding(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_runtime_only_constants_are_not_exportable() {
        let mut heap = Collector::new();
        let script = heap.new_function(None, 0, &NoRoots);
        heap.push_safe(Value::Obj(script));
        let array = heap.new_array(vec![], &NoRoots);
        if let Some(f) = heap.as_function_mut(script) {
            f.bytecode.constants.push(Value::Obj(array));
        }

        let err = export(&heap, script).expect_err("arrays are not literals");
        assert_eq!(err.to_string(), "cannot export constant of type array");
    }
}
