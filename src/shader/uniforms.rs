//! CRT effect parameters, their GPU layout, and named-uniform resolution.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::mem::offset_of;

/// Phosphor mask pattern simulated by the shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum MaskType {
    None = 0,
    #[default]
    ApertureGrille = 1,
    SlotMask = 2,
    ShadowMask = 3,
}

impl TryFrom<i32> for MaskType {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MaskType::None),
            1 => Ok(MaskType::ApertureGrille),
            2 => Ok(MaskType::SlotMask),
            3 => Ok(MaskType::ShadowMask),
            other => Err(other),
        }
    }
}

/// Effect parameters as the host sees them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrtParams {
    pub scanline_weight: f32,
    pub scanline_gap: f32,
    pub mask_brightness: f32,
    pub mask_type: MaskType,
    pub bloom_factor: f32,
    pub input_gamma: f32,
    pub output_gamma: f32,
}

impl Default for CrtParams {
    fn default() -> Self {
        Self {
            scanline_weight: 6.0,
            scanline_gap: 0.12,
            mask_brightness: 0.7,
            mask_type: MaskType::ApertureGrille,
            bloom_factor: 0.15,
            input_gamma: 2.4,
            output_gamma: 2.2,
        }
    }
}

impl CrtParams {
    pub fn get(&self, field: UniformField) -> UniformValue {
        match field {
            UniformField::ScanlineWeight => UniformValue::Float(self.scanline_weight),
            UniformField::ScanlineGap => UniformValue::Float(self.scanline_gap),
            UniformField::MaskBrightness => UniformValue::Float(self.mask_brightness),
            UniformField::MaskType => UniformValue::Int(self.mask_type as i32),
            UniformField::BloomFactor => UniformValue::Float(self.bloom_factor),
            UniformField::InputGamma => UniformValue::Float(self.input_gamma),
            UniformField::OutputGamma => UniformValue::Float(self.output_gamma),
        }
    }

    /// Sets one field, converting between int and float as needed.
    ///
    /// Returns false when the value is rejected (an out-of-range mask type).
    pub fn set(&mut self, field: UniformField, value: UniformValue) -> bool {
        let float = value.as_f32();
        match field {
            UniformField::ScanlineWeight => self.scanline_weight = float,
            UniformField::ScanlineGap => self.scanline_gap = float,
            UniformField::MaskBrightness => self.mask_brightness = float,
            UniformField::MaskType => match MaskType::try_from(value.as_i32()) {
                Ok(mask) => self.mask_type = mask,
                Err(_) => return false,
            },
            UniformField::BloomFactor => self.bloom_factor = float,
            UniformField::InputGamma => self.input_gamma = float,
            UniformField::OutputGamma => self.output_gamma = float,
        }
        true
    }
}

/// GPU-side uniform block, matching `struct CrtUniforms` in `shaders/crt.wgsl`.
///
/// WGSL uniform structs round up to 16 bytes, hence the trailing pad.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct CrtUniforms {
    pub scanline_weight: f32,
    pub scanline_gap: f32,
    pub mask_brightness: f32,
    pub mask_type: i32,
    pub bloom_factor: f32,
    pub input_gamma: f32,
    pub output_gamma: f32,
    pub _padding: f32,
}

const _: () = assert!(std::mem::size_of::<CrtUniforms>() % 16 == 0);

impl From<&CrtParams> for CrtUniforms {
    fn from(p: &CrtParams) -> Self {
        Self {
            scanline_weight: p.scanline_weight,
            scanline_gap: p.scanline_gap,
            mask_brightness: p.mask_brightness,
            mask_type: p.mask_type as i32,
            bloom_factor: p.bloom_factor,
            input_gamma: p.input_gamma,
            output_gamma: p.output_gamma,
            _padding: 0.0,
        }
    }
}

/// The uniform names every build understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformField {
    ScanlineWeight,
    ScanlineGap,
    MaskBrightness,
    MaskType,
    BloomFactor,
    InputGamma,
    OutputGamma,
}

impl UniformField {
    pub const ALL: [UniformField; 7] = [
        UniformField::ScanlineWeight,
        UniformField::ScanlineGap,
        UniformField::MaskBrightness,
        UniformField::MaskType,
        UniformField::BloomFactor,
        UniformField::InputGamma,
        UniformField::OutputGamma,
    ];

    /// Resolves a host-facing (`maskBrightness`) or shader-facing (`mask_brightness`) name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "scanlineWeight" | "scanline_weight" => Some(UniformField::ScanlineWeight),
            "scanlineGap" | "scanline_gap" => Some(UniformField::ScanlineGap),
            "maskBrightness" | "mask_brightness" => Some(UniformField::MaskBrightness),
            "maskType" | "mask_type" => Some(UniformField::MaskType),
            "bloomFactor" | "bloom_factor" => Some(UniformField::BloomFactor),
            "inputGamma" | "input_gamma" => Some(UniformField::InputGamma),
            "outputGamma" | "output_gamma" => Some(UniformField::OutputGamma),
            _ => None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    fn canonical_slot(self) -> LayoutSlot {
        let (offset, kind) = match self {
            UniformField::ScanlineWeight => (offset_of!(CrtUniforms, scanline_weight), ScalarKind::F32),
            UniformField::ScanlineGap => (offset_of!(CrtUniforms, scanline_gap), ScalarKind::F32),
            UniformField::MaskBrightness => (offset_of!(CrtUniforms, mask_brightness), ScalarKind::F32),
            UniformField::MaskType => (offset_of!(CrtUniforms, mask_type), ScalarKind::I32),
            UniformField::BloomFactor => (offset_of!(CrtUniforms, bloom_factor), ScalarKind::F32),
            UniformField::InputGamma => (offset_of!(CrtUniforms, input_gamma), ScalarKind::F32),
            UniformField::OutputGamma => (offset_of!(CrtUniforms, output_gamma), ScalarKind::F32),
        };
        LayoutSlot { offset: offset as u32, kind }
    }
}

/// 32-bit scalar types a uniform member can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    F32,
    I32,
    U32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
}

impl UniformValue {
    pub fn as_f32(self) -> f32 {
        match self {
            UniformValue::Float(v) => v,
            UniformValue::Int(v) => v as f32,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            UniformValue::Float(v) => v as i32,
            UniformValue::Int(v) => v,
        }
    }

    fn encode(self, kind: ScalarKind) -> [u8; 4] {
        match kind {
            ScalarKind::F32 => self.as_f32().to_ne_bytes(),
            ScalarKind::I32 => self.as_i32().to_ne_bytes(),
            ScalarKind::U32 => (self.as_i32().max(0) as u32).to_ne_bytes(),
        }
    }
}

/// Byte offset and type of one scalar member in a shader's uniform struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutSlot {
    pub offset: u32,
    pub kind: ScalarKind,
}

/// Where each uniform lives in a particular program's uniform buffer.
///
/// Built once per compile from shader reflection. Known fields are indexed by
/// `UniformField`; any other scalar members go into the by-name table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UniformLayout {
    size: u32,
    fields: [Option<LayoutSlot>; 7],
    extra: HashMap<String, LayoutSlot>,
    canonical: bool,
}

impl UniformLayout {
    /// Layout of a program that declares no uniform struct.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Layout identical to `CrtUniforms`.
    pub fn canonical() -> Self {
        let mut fields = [None; 7];
        for field in UniformField::ALL {
            fields[field.index()] = Some(field.canonical_slot());
        }
        Self {
            size: std::mem::size_of::<CrtUniforms>() as u32,
            fields,
            extra: HashMap::new(),
            canonical: true,
        }
    }

    /// Builds a layout from reflected `(name, offset, kind)` struct members.
    pub fn from_members<'a>(size: u32, members: impl IntoIterator<Item = (&'a str, u32, ScalarKind)>) -> Self {
        let mut fields = [None; 7];
        let mut extra = HashMap::new();
        for (name, offset, kind) in members {
            let slot = LayoutSlot { offset, kind };
            match UniformField::from_name(name) {
                Some(field) => fields[field.index()] = Some(slot),
                None => {
                    extra.insert(name.to_string(), slot);
                }
            }
        }

        let canonical = size as usize == std::mem::size_of::<CrtUniforms>()
            && UniformField::ALL
                .iter()
                .all(|f| fields[f.index()] == Some(f.canonical_slot()))
            && extra.keys().all(|name| name.starts_with('_'));

        Self {
            size,
            fields,
            extra,
            canonical,
        }
    }

    /// Declared struct size in bytes (0 when the program has no uniforms).
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Size of the uniform buffer to allocate: never zero, a multiple of 16.
    pub fn buffer_size(&self) -> u64 {
        let size = u64::from(self.size.max(16));
        (size + 15) & !15
    }

    pub fn field(&self, field: UniformField) -> Option<LayoutSlot> {
        self.fields[field.index()]
    }

    /// Slot of a member that is not one of the known fields.
    pub fn extra(&self, name: &str) -> Option<LayoutSlot> {
        self.extra.get(name).copied()
    }

    pub fn is_canonical(&self) -> bool {
        self.canonical
    }
}

/// The engine's uniform block plus shader-specific named overrides.
///
/// Cloned as a whole for each frame, so a frame never sees half an update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UniformState {
    pub params: CrtParams,
    extras: Vec<(String, UniformValue)>,
}

impl UniformState {
    pub fn new(params: CrtParams) -> Self {
        Self {
            params,
            extras: Vec::new(),
        }
    }

    /// Applies a named value.
    ///
    /// Known fields always land in `params`. Other names are kept only if the
    /// active program's layout declares them; everything else is ignored.
    /// Returns whether anything changed.
    pub fn set_named(&mut self, name: &str, value: UniformValue, active: Option<&UniformLayout>) -> bool {
        if let Some(field) = UniformField::from_name(name) {
            return self.params.set(field, value);
        }

        if active.and_then(|layout| layout.extra(name)).is_none() {
            return false;
        }
        match self.extras.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.extras.push((name.to_string(), value)),
        }
        true
    }

    pub fn extra(&self, name: &str) -> Option<UniformValue> {
        self.extras.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    /// Serializes this state into the uniform buffer bytes `layout` expects.
    pub fn pack(&self, layout: &UniformLayout) -> Vec<u8> {
        let mut bytes = vec![0u8; layout.buffer_size() as usize];

        if layout.is_canonical() {
            let block = CrtUniforms::from(&self.params);
            bytes[..std::mem::size_of::<CrtUniforms>()].copy_from_slice(bytemuck::bytes_of(&block));
        } else {
            for field in UniformField::ALL {
                if let Some(slot) = layout.field(field) {
                    write_slot(&mut bytes, slot, self.params.get(field));
                }
            }
        }

        for (name, value) in &self.extras {
            if let Some(slot) = layout.extra(name) {
                write_slot(&mut bytes, slot, *value);
            }
        }
        bytes
    }
}

fn write_slot(bytes: &mut [u8], slot: LayoutSlot, value: UniformValue) {
    let start = slot.offset as usize;
    if let Some(dst) = bytes.get_mut(start..start + 4) {
        dst.copy_from_slice(&value.encode(slot.kind));
    }
}
