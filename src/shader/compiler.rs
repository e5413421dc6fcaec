//! Front-end shader checks with naga: parse, validate, reflect the uniform layout.
//!
//! Everything that could make wgpu reject the program is caught here, so a
//! bad edit comes back as a `CrtError::Compile` diagnostic instead of a
//! validation panic inside the device.

use super::uniforms::{ScalarKind, UniformLayout};
use super::{ShaderLanguage, ShaderSource};
use crate::error::{CrtError, Result};
use naga::front::glsl::{Frontend, Options};
use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::{AddressSpace, Binding, ImageClass, ImageDimension, Module, ShaderStage, TypeInner};

/// Binding slots of group 0 every program shares.
pub const TEXTURE_BINDING: u32 = 0;
pub const SAMPLER_BINDING: u32 = 1;
pub const UNIFORM_BINDING: u32 = 2;

/// A shader that passed validation, ready to hand to the GPU.
#[derive(Debug, Clone)]
pub struct CheckedShader {
    /// WGSL text (GLSL input is translated)
    pub wgsl: String,
    pub entry_point: &'static str,
    pub layout: UniformLayout,
}

/// Parses, validates and reflects `source` against the portable baseline capabilities.
pub fn check(source: &ShaderSource) -> Result<CheckedShader> {
    check_with(source, Capabilities::default())
}

/// Like [`check`], but accepts whatever `capabilities` the target device offers.
pub fn check_with(source: &ShaderSource, capabilities: Capabilities) -> Result<CheckedShader> {
    let code = source.code.as_str();
    let module = match source.language {
        ShaderLanguage::Wgsl => {
            naga::front::wgsl::parse_str(code).map_err(|e| CrtError::Compile(e.emit_to_string(code)))?
        }
        ShaderLanguage::Glsl => {
            let mut frontend = Frontend::default();
            let options = Options::from(ShaderStage::Fragment);
            frontend
                .parse(&options, code)
                .map_err(|e| CrtError::Compile(e.emit_to_string(code)))?
        }
    };

    let mut validator = Validator::new(ValidationFlags::all(), capabilities);
    let info = validator
        .validate(&module)
        .map_err(|e| CrtError::Compile(e.emit_to_string(code)))?;

    let entry_point = source.language.fragment_entry_point();
    check_entry_point(&module, entry_point)?;
    check_bindings(&module)?;
    let layout = reflect_uniform_layout(&module);

    let wgsl = match source.language {
        ShaderLanguage::Wgsl => source.code.clone(),
        ShaderLanguage::Glsl => naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())
            .map_err(|e| CrtError::Compile(format!("WGSL generation error: {e}")))?,
    };

    Ok(CheckedShader {
        wgsl,
        entry_point,
        layout,
    })
}

fn check_entry_point(module: &Module, name: &str) -> Result<()> {
    let entry = module
        .entry_points
        .iter()
        .find(|ep| ep.stage == ShaderStage::Fragment && ep.name == name)
        .ok_or_else(|| CrtError::Compile(format!("no fragment entry point `{name}`")))?;

    // The built-in vertex stage only provides texture coordinates at location 0.
    for arg in &entry.function.arguments {
        let mut bindings = Vec::new();
        match &module.types[arg.ty].inner {
            TypeInner::Struct { members, .. } => {
                bindings.extend(members.iter().map(|m| (m.binding.as_ref(), m.ty)));
            }
            _ => bindings.push((arg.binding.as_ref(), arg.ty)),
        }

        for (binding, ty) in bindings {
            if let Some(Binding::Location { location, .. }) = binding {
                let is_vec2_f32 = matches!(
                    module.types[ty].inner,
                    TypeInner::Vector {
                        size: naga::VectorSize::Bi,
                        scalar: naga::Scalar { kind: naga::ScalarKind::Float, width: 4 },
                    }
                );
                if *location != 0 || !is_vec2_f32 {
                    return Err(CrtError::Compile(format!(
                        "fragment input @location({location}) is not provided; only @location(0) vec2<f32> texture coordinates are"
                    )));
                }
            }
        }
    }
    Ok(())
}

fn check_bindings(module: &Module) -> Result<()> {
    for (_, var) in module.global_variables.iter() {
        let Some(rb) = &var.binding else {
            continue;
        };
        let inner = &module.types[var.ty].inner;
        let ok = rb.group == 0
            && match rb.binding {
                TEXTURE_BINDING => matches!(
                    inner,
                    TypeInner::Image {
                        dim: ImageDimension::D2,
                        arrayed: false,
                        class: ImageClass::Sampled { kind: naga::ScalarKind::Float, multi: false },
                    }
                ),
                SAMPLER_BINDING => matches!(inner, TypeInner::Sampler { comparison: false }),
                UNIFORM_BINDING => var.space == AddressSpace::Uniform,
                _ => false,
            };
        if !ok {
            let name = var.name.as_deref().unwrap_or("<unnamed>");
            return Err(CrtError::Compile(format!(
                "unsupported resource `{name}` at @group({}) @binding({}); expected texture_2d<f32> at 0, sampler at 1, uniform at 2 in group 0",
                rb.group, rb.binding
            )));
        }
    }
    Ok(())
}

/// Builds the name→offset table from the struct bound at the uniform slot.
///
/// Any other uniform type still reports its size so the buffer covers the binding.
fn reflect_uniform_layout(module: &Module) -> UniformLayout {
    let uniform = module.global_variables.iter().find(|(_, var)| {
        var.space == AddressSpace::Uniform
            && matches!(&var.binding, Some(rb) if rb.group == 0 && rb.binding == UNIFORM_BINDING)
    });
    let Some((_, var)) = uniform else {
        return UniformLayout::empty();
    };

    let inner = &module.types[var.ty].inner;
    let TypeInner::Struct { members, span } = inner else {
        return UniformLayout::from_members(inner.size(module.to_ctx()), std::iter::empty());
    };

    let scalars = members.iter().filter_map(|member| {
        let name = member.name.as_deref()?;
        let TypeInner::Scalar(scalar) = module.types[member.ty].inner else {
            return None;
        };
        let kind = match (scalar.kind, scalar.width) {
            (naga::ScalarKind::Float, 4) => ScalarKind::F32,
            (naga::ScalarKind::Sint, 4) => ScalarKind::I32,
            (naga::ScalarKind::Uint, 4) => ScalarKind::U32,
            _ => return None,
        };
        Some((name, member.offset, kind))
    });
    UniformLayout::from_members(*span, scalars)
}
