use std::collections::HashMap;

use crate::bytecode::{Cell, OpCode, CELL_SIZE};

const MAGIC: [u8; 4] = *b"PJT1";
const VERSION_V1: u16 = 1;
const ENCODE_VERSION: u16 = VERSION_V1;
const FLAGS: u16 = 0;

const MAX_CODE_BYTES: usize = 64 * 1024 * 1024;
const MAX_NAME_BYTES: usize = 4096;
const MAX_TABLE_ENTRIES: usize = 65_536;

/// Smallest heap-plus-stack window a plugin may run with.
pub const MIN_HEAP_AND_STACK_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    UnexpectedEof,
    InvalidMagic([u8; 4]),
    UnsupportedVersion(u16),
    UnsupportedFlags(u16),
    InvalidUtf8,
    NameTooLong(usize),
    CodeTooLong(usize),
    CodeNotCellAligned(usize),
    TableTooLarge(&'static str, usize),
    PublicOffsetOutOfRange { name: String, offset: u32 },
    MemSizeTooSmall { mem_size: u32, data_size: u32 },
    TrailingBytes,
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageError::UnexpectedEof => write!(f, "unexpected end of input"),
            ImageError::InvalidMagic(found) => write!(f, "invalid magic: {found:?}"),
            ImageError::UnsupportedVersion(version) => {
                write!(f, "unsupported version: {version}")
            }
            ImageError::UnsupportedFlags(flags) => write!(f, "unsupported flags: {flags}"),
            ImageError::InvalidUtf8 => write!(f, "invalid utf-8 name"),
            ImageError::NameTooLong(len) => write!(f, "name too long: {len}"),
            ImageError::CodeTooLong(len) => write!(f, "code too long: {len}"),
            ImageError::CodeNotCellAligned(len) => {
                write!(f, "code length {len} is not a multiple of the cell size")
            }
            ImageError::TableTooLarge(table, len) => {
                write!(f, "{table} table too large: {len}")
            }
            ImageError::PublicOffsetOutOfRange { name, offset } => {
                write!(f, "public '{name}' points outside the code section: {offset}")
            }
            ImageError::MemSizeTooSmall { mem_size, data_size } => {
                write!(f, "memory size {mem_size} cannot hold the {data_size}-byte data section")
            }
            ImageError::TrailingBytes => write!(f, "trailing bytes after image payload"),
        }
    }
}

impl std::error::Error for ImageError {}

/// A decoded plugin image: the p-code blob, the initialized data section,
/// the total plugin memory size (data + heap + stack), and the native and
/// public tables. Images are pre-verified at the method level; the loader
/// only checks the container here.
#[derive(Debug, Clone)]
pub struct PluginImage {
    code: Vec<u8>,
    data: Vec<u8>,
    mem_size: u32,
    natives: Vec<String>,
    publics: Vec<Public>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Public {
    pub name: String,
    pub pcode_offset: u32,
}

impl PluginImage {
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn mem_size(&self) -> u32 {
        self.mem_size
    }

    pub fn natives(&self) -> &[String] {
        &self.natives
    }

    pub fn publics(&self) -> &[Public] {
        &self.publics
    }

    pub fn find_public(&self, name: &str) -> Option<&Public> {
        self.publics.iter().find(|public| public.name == name)
    }

    /// Best-effort function name for diagnostics. Falls back to the raw
    /// offset when the image carries no matching public.
    pub fn lookup_function(&self, pcode_offset: u32) -> String {
        self.publics
            .iter()
            .find(|public| public.pcode_offset == pcode_offset)
            .map(|public| public.name.clone())
            .unwrap_or_else(|| format!("fn@{pcode_offset:#x}"))
    }
}

pub fn decode_image(bytes: &[u8]) -> Result<PluginImage, ImageError> {
    let mut reader = ByteReader::new(bytes);

    let magic = reader.read_array::<4>()?;
    if magic != MAGIC {
        return Err(ImageError::InvalidMagic(magic));
    }
    let version = reader.read_u16()?;
    if version != VERSION_V1 {
        return Err(ImageError::UnsupportedVersion(version));
    }
    let flags = reader.read_u16()?;
    if flags != FLAGS {
        return Err(ImageError::UnsupportedFlags(flags));
    }

    let code_len = reader.read_u32()? as usize;
    if code_len > MAX_CODE_BYTES {
        return Err(ImageError::CodeTooLong(code_len));
    }
    if code_len % CELL_SIZE != 0 {
        return Err(ImageError::CodeNotCellAligned(code_len));
    }
    let code = reader.read_bytes(code_len)?.to_vec();

    let data_len = reader.read_u32()? as usize;
    if data_len > MAX_CODE_BYTES {
        return Err(ImageError::CodeTooLong(data_len));
    }
    if data_len % CELL_SIZE != 0 {
        return Err(ImageError::CodeNotCellAligned(data_len));
    }
    let data = reader.read_bytes(data_len)?.to_vec();

    let mem_size = reader.read_u32()?;
    if (mem_size as usize) < data_len + MIN_HEAP_AND_STACK_BYTES
        || mem_size % CELL_SIZE as u32 != 0
    {
        return Err(ImageError::MemSizeTooSmall { mem_size, data_size: data_len as u32 });
    }

    let native_count = reader.read_u32()? as usize;
    if native_count > MAX_TABLE_ENTRIES {
        return Err(ImageError::TableTooLarge("native", native_count));
    }
    let mut natives = Vec::with_capacity(native_count);
    for _ in 0..native_count {
        natives.push(reader.read_name()?);
    }

    let public_count = reader.read_u32()? as usize;
    if public_count > MAX_TABLE_ENTRIES {
        return Err(ImageError::TableTooLarge("public", public_count));
    }
    let mut publics = Vec::with_capacity(public_count);
    for _ in 0..public_count {
        let name = reader.read_name()?;
        let pcode_offset = reader.read_u32()?;
        if pcode_offset as usize >= code.len() {
            return Err(ImageError::PublicOffsetOutOfRange { name, offset: pcode_offset });
        }
        publics.push(Public { name, pcode_offset });
    }

    if !reader.is_empty() {
        return Err(ImageError::TrailingBytes);
    }

    Ok(PluginImage { code, data, mem_size, natives, publics })
}

pub fn encode_image(image: &PluginImage) -> Result<Vec<u8>, ImageError> {
    if image.code.len() > MAX_CODE_BYTES {
        return Err(ImageError::CodeTooLong(image.code.len()));
    }
    if image.code.len() % CELL_SIZE != 0 {
        return Err(ImageError::CodeNotCellAligned(image.code.len()));
    }

    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&ENCODE_VERSION.to_le_bytes());
    out.extend_from_slice(&FLAGS.to_le_bytes());

    out.extend_from_slice(&(image.code.len() as u32).to_le_bytes());
    out.extend_from_slice(&image.code);

    out.extend_from_slice(&(image.data.len() as u32).to_le_bytes());
    out.extend_from_slice(&image.data);
    out.extend_from_slice(&image.mem_size.to_le_bytes());

    out.extend_from_slice(&(image.natives.len() as u32).to_le_bytes());
    for name in &image.natives {
        write_name(&mut out, name)?;
    }

    out.extend_from_slice(&(image.publics.len() as u32).to_le_bytes());
    for public in &image.publics {
        write_name(&mut out, &public.name)?;
        out.extend_from_slice(&public.pcode_offset.to_le_bytes());
    }

    Ok(out)
}

fn write_name(out: &mut Vec<u8>, name: &str) -> Result<(), ImageError> {
    if name.len() > MAX_NAME_BYTES {
        return Err(ImageError::NameTooLong(name.len()));
    }
    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    Ok(())
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, at: 0 }
    }

    fn is_empty(&self) -> bool {
        self.at == self.bytes.len()
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ImageError> {
        if self.at + len > self.bytes.len() {
            return Err(ImageError::UnexpectedEof);
        }
        let slice = &self.bytes[self.at..self.at + len];
        self.at += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ImageError> {
        let slice = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn read_u16(&mut self) -> Result<u16, ImageError> {
        Ok(u16::from_le_bytes(self.read_array::<2>()?))
    }

    fn read_u32(&mut self) -> Result<u32, ImageError> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?))
    }

    fn read_name(&mut self) -> Result<String, ImageError> {
        let len = self.read_u32()? as usize;
        if len > MAX_NAME_BYTES {
            return Err(ImageError::NameTooLong(len));
        }
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ImageError::InvalidUtf8)
    }
}

/// Builds plugin images cell by cell. Jump targets use named labels resolved
/// at finish time, like the bytecode assembler this image format grew out of.
pub struct ImageBuilder {
    code: Vec<u8>,
    data: Vec<u8>,
    mem_size: Option<u32>,
    natives: Vec<String>,
    publics: Vec<Public>,
    labels: HashMap<String, u32>,
    fixups: Vec<Fixup>,
}

struct Fixup {
    at: usize,
    label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    DuplicateLabel(String),
    UnknownLabel(String),
    DuplicatePublic(String),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::DuplicateLabel(name) => write!(f, "duplicate label '{name}'"),
            BuildError::UnknownLabel(name) => write!(f, "unknown label '{name}'"),
            BuildError::DuplicatePublic(name) => write!(f, "duplicate public '{name}'"),
        }
    }
}

impl std::error::Error for BuildError {}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            data: Vec::new(),
            mem_size: None,
            natives: Vec::new(),
            publics: Vec::new(),
            labels: HashMap::new(),
            fixups: Vec::new(),
        }
    }

    pub fn position(&self) -> u32 {
        self.code.len() as u32
    }

    /// Appends a cell to the data section and returns its byte address.
    pub fn data_cell(&mut self, value: Cell) -> Cell {
        let at = self.data.len() as Cell;
        self.data.extend_from_slice(&value.to_le_bytes());
        at
    }

    pub fn mem_size(&mut self, mem_size: u32) -> &mut Self {
        self.mem_size = Some(mem_size);
        self
    }

    pub fn add_native(&mut self, name: &str) -> Cell {
        let index = self.natives.len() as Cell;
        self.natives.push(name.to_string());
        index
    }

    /// Marks the current position as a public function entry. The next cell
    /// emitted should be `PROC`.
    pub fn public(&mut self, name: &str) -> Result<u32, BuildError> {
        if self.publics.iter().any(|public| public.name == name) {
            return Err(BuildError::DuplicatePublic(name.to_string()));
        }
        let offset = self.position();
        self.publics.push(Public { name: name.to_string(), pcode_offset: offset });
        Ok(offset)
    }

    pub fn label(&mut self, name: &str) -> Result<(), BuildError> {
        if self.labels.contains_key(name) {
            return Err(BuildError::DuplicateLabel(name.to_string()));
        }
        let pos = self.position();
        self.labels.insert(name.to_string(), pos);
        Ok(())
    }

    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.emit_cell(op as Cell);
        self
    }

    pub fn op1(&mut self, op: OpCode, operand: Cell) -> &mut Self {
        self.emit_cell(op as Cell);
        self.emit_cell(operand);
        self
    }

    /// Emits a jump-family opcode whose target is a label.
    pub fn jump(&mut self, op: OpCode, label: &str) -> &mut Self {
        self.emit_cell(op as Cell);
        let at = self.code.len();
        self.emit_cell(0);
        self.fixups.push(Fixup { at, label: label.to_string() });
        self
    }

    pub fn finish(mut self) -> Result<PluginImage, BuildError> {
        for fixup in self.fixups.drain(..) {
            let target = self
                .labels
                .get(&fixup.label)
                .copied()
                .ok_or_else(|| BuildError::UnknownLabel(fixup.label.clone()))?;
            self.code[fixup.at..fixup.at + CELL_SIZE]
                .copy_from_slice(&(target as Cell).to_le_bytes());
        }
        let mem_size = self.mem_size.unwrap_or_else(|| {
            (self.data.len() + 4 * MIN_HEAP_AND_STACK_BYTES) as u32
        });
        Ok(PluginImage {
            code: self.code,
            data: self.data,
            mem_size,
            natives: self.natives,
            publics: self.publics,
        })
    }

    fn emit_cell(&mut self, cell: Cell) {
        self.code.extend_from_slice(&cell.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> PluginImage {
        let mut builder = ImageBuilder::new();
        builder.add_native("print");
        builder.public("main").expect("public should register");
        builder
            .op(OpCode::Proc)
            .op1(OpCode::ConstPri, 7)
            .op(OpCode::Retn)
            .op(OpCode::EndProc);
        builder.finish().expect("image should build")
    }

    #[test]
    fn encode_decode_round_trips() {
        let image = sample_image();
        let bytes = encode_image(&image).expect("encode should succeed");
        let decoded = decode_image(&bytes).expect("decode should succeed");
        assert_eq!(decoded.code(), image.code());
        assert_eq!(decoded.data(), image.data());
        assert_eq!(decoded.mem_size(), image.mem_size());
        assert_eq!(decoded.natives(), image.natives());
        assert_eq!(decoded.publics(), image.publics());
    }

    #[test]
    fn decode_rejects_undersized_memory() {
        let image = sample_image();
        let mut bytes = encode_image(&image).expect("encode should succeed");
        // mem_size trails the (empty) data section.
        let code_len = image.code().len();
        let at = 8 + 4 + code_len + 4;
        bytes[at..at + 4].copy_from_slice(&8u32.to_le_bytes());
        assert!(matches!(
            decode_image(&bytes),
            Err(ImageError::MemSizeTooSmall { .. })
        ));
    }

    #[test]
    fn decode_rejects_bad_magic_and_version() {
        let image = sample_image();
        let mut bytes = encode_image(&image).expect("encode should succeed");
        bytes[0] = b'X';
        assert!(matches!(decode_image(&bytes), Err(ImageError::InvalidMagic(_))));

        let mut bytes = encode_image(&image).expect("encode should succeed");
        bytes[4] = 0xFF;
        assert!(matches!(
            decode_image(&bytes),
            Err(ImageError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn decode_rejects_trailing_bytes_and_truncation() {
        let image = sample_image();
        let mut bytes = encode_image(&image).expect("encode should succeed");
        bytes.push(0);
        assert!(matches!(decode_image(&bytes), Err(ImageError::TrailingBytes)));

        let bytes = encode_image(&image).expect("encode should succeed");
        assert!(matches!(
            decode_image(&bytes[..bytes.len() - 2]),
            Err(ImageError::UnexpectedEof)
        ));
    }

    #[test]
    fn builder_resolves_forward_labels() {
        let mut builder = ImageBuilder::new();
        builder.public("main").expect("public should register");
        builder.op(OpCode::Proc);
        builder.jump(OpCode::Jump, "done");
        builder.op1(OpCode::ConstPri, 1);
        builder.label("done").expect("label should bind");
        builder.op(OpCode::Retn).op(OpCode::EndProc);
        let image = builder.finish().expect("image should build");

        // jump operand is the byte offset of the label.
        let operand = crate::bytecode::read_cell(image.code(), 8).expect("operand cell");
        assert_eq!(operand, 20);
    }

    #[test]
    fn unknown_label_fails_finish() {
        let mut builder = ImageBuilder::new();
        builder.jump(OpCode::Jump, "nowhere");
        assert_eq!(
            builder.finish().expect_err("finish should fail"),
            BuildError::UnknownLabel("nowhere".to_string())
        );
    }

    #[test]
    fn lookup_function_falls_back_to_offset() {
        let image = sample_image();
        assert_eq!(image.lookup_function(0), "main");
        assert_eq!(image.lookup_function(0x40), "fn@0x40");
    }
}
