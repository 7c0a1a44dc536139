//! Shader program manager.
//!
//! Fragment sources name their samplers through `samplerPlaceholder<N>`
//! tokens. At build time each token is replaced with the keyword matching
//! the concrete kind of the `N`th bound texture, and the shared prelude is
//! prepended before the backend compiles and links the pair.

use std::fmt::Write as _;
use std::sync::OnceLock;

use regex::Regex;

use crate::backend::{ProgramId, ProgramKind, ProgramSource, RenderBackend};
use crate::error::RenderError;
use crate::texture::SampledTexture;
use crate::types::SamplerKind;

const PLACEHOLDER_PATTERN: &str = r"samplerPlaceholder(\d*)";

fn placeholder_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(PLACEHOLDER_PATTERN).expect("placeholder pattern is valid"))
}

/// Replaces every `samplerPlaceholder<N>` with the keyword of `textures[N]`.
///
/// All tokens are validated before anything is substituted, so a bad index
/// never yields a partially rewritten source.
pub fn substitute_sampler_placeholders(
    source: &str,
    textures: &[SamplerKind],
) -> Result<String, RenderError> {
    let regex = placeholder_regex();
    for captures in regex.captures_iter(source) {
        let whole = captures.get(0).map(|m| m.start()).unwrap_or_default();
        let digits = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        if digits.is_empty() {
            return Err(RenderError::MalformedPlaceholder { offset: whole });
        }
        let index = digits.parse::<usize>().unwrap_or(usize::MAX);
        if index >= textures.len() {
            return Err(RenderError::PlaceholderIndexOutOfRange {
                index,
                available: textures.len(),
            });
        }
    }

    let substituted = regex.replace_all(source, |captures: &regex::Captures<'_>| {
        // Indices were validated above.
        let index: usize = captures[1].parse().unwrap_or_default();
        textures[index].glsl_keyword().to_string()
    });
    Ok(substituted.into_owned())
}

/// Builds one of the compositor's programs against `textures`.
pub fn build_program<B: RenderBackend + ?Sized>(
    backend: &mut B,
    kind: ProgramKind,
    textures: &[SamplerKind],
) -> Result<ProgramId, RenderError> {
    build_program_from_source(backend, kind, fragment_body(kind), textures)
}

/// Builds `kind` against the textures it will sample, in binding order.
/// Each texture supplies its own sampler kind.
pub fn build_program_for<B: RenderBackend + ?Sized>(
    backend: &mut B,
    kind: ProgramKind,
    textures: &[&dyn SampledTexture],
) -> Result<ProgramId, RenderError> {
    let kinds: Vec<SamplerKind> = textures.iter().map(|texture| texture.sampler_kind()).collect();
    build_program(backend, kind, &kinds)
}

/// Substitutes placeholders in `fragment_body`, wraps it with the prelude and
/// asks the backend to compile and link it.
///
/// Every failure is logged with its full diagnostic text before it is
/// returned; callers treat the error as fatal for the pipeline.
pub fn build_program_from_source<B: RenderBackend + ?Sized>(
    backend: &mut B,
    kind: ProgramKind,
    fragment_body: &str,
    textures: &[SamplerKind],
) -> Result<ProgramId, RenderError> {
    let fragment = match substitute_sampler_placeholders(fragment_body, textures) {
        Ok(body) => wrap_fragment(&body, textures.len()),
        Err(err) => {
            tracing::error!(program = kind.label(), error = %err, "invalid shader source");
            return Err(err);
        }
    };

    let source = ProgramSource {
        kind,
        vertex: VERTEX_SHADER_GLSL.to_string(),
        fragment,
        texture_count: textures.len(),
    };

    match backend.compile_program(&source) {
        Ok(program) => {
            tracing::debug!(program = kind.label(), textures = textures.len(), "linked program");
            Ok(program)
        }
        Err(err) => {
            tracing::error!(program = kind.label(), error = %err, "failed to build program");
            Err(err)
        }
    }
}

/// Fragment body of a built-in program, before substitution.
pub fn fragment_body(kind: ProgramKind) -> &'static str {
    match kind {
        ProgramKind::Preview => PREVIEW_FRAGMENT,
        ProgramKind::Accumulate => ACCUMULATE_FRAGMENT,
        ProgramKind::Present => PRESENT_FRAGMENT,
    }
}

/// Prepends [`HEADER`] plus one `texture2D` declaration per bound texture.
fn wrap_fragment(body: &str, texture_count: usize) -> String {
    let mut wrapped = String::from(HEADER);
    for index in 0..texture_count {
        let _ = writeln!(
            wrapped,
            "layout(set = 1, binding = {binding}) uniform texture2D u_texture{index};",
            binding = index + 1
        );
    }
    wrapped.push_str("\n#line 1\n");
    wrapped.push_str(body);
    wrapped
}

/// GLSL prologue shared by every fragment program.
///
/// Camera frames are uploaded as ordinary 2D images, so the video sampler
/// keyword resolves to `sampler2D` on this pipeline.
const HEADER: &str = r"#version 450
layout(location = 0) in vec2 v_texcoord;
layout(location = 0) out vec4 outColor;

layout(std140, set = 0, binding = 0) uniform PassParams {
    mat4 u_transform;
} params;

layout(set = 1, binding = 0) uniform sampler u_sampler;

#define videoSampler2D sampler2D
";

const PREVIEW_FRAGMENT: &str = r"void main() {
    vec2 uv = (params.u_transform * vec4(v_texcoord, 0.0, 1.0)).xy;
    outColor = texture(samplerPlaceholder0(u_texture0, u_sampler), uv);
}
";

const ACCUMULATE_FRAGMENT: &str = r"const float EXPOSURE_MIX = 0.01;

float brightness(vec4 c) {
    return c.r * 0.2126 + c.g * 0.7152 + c.b * 0.0722 + c.a;
}

void main() {
    vec2 uv = (params.u_transform * vec4(v_texcoord, 0.0, 1.0)).xy;
    vec4 color = texture(samplerPlaceholder0(u_texture0, u_sampler), uv);
    vec4 oldColor = texture(samplerPlaceholder1(u_texture1, u_sampler), v_texcoord);
    if (brightness(color) > brightness(oldColor)) {
        outColor = mix(color, oldColor, EXPOSURE_MIX);
    } else {
        outColor = mix(oldColor, color, EXPOSURE_MIX);
    }
}
";

const PRESENT_FRAGMENT: &str = r"void main() {
    outColor = texture(samplerPlaceholder0(u_texture0, u_sampler), v_texcoord);
}
";

/// Full-screen triangle; `v_texcoord` has its origin at the top-left.
const VERTEX_SHADER_GLSL: &str = r"#version 450
layout(location = 0) out vec2 v_texcoord;

const vec2 positions[3] = vec2[3](
    vec2(-1.0, -3.0),
    vec2(3.0, 1.0),
    vec2(-1.0, 1.0)
);

void main() {
    vec2 pos = positions[uint(gl_VertexIndex)];
    v_texcoord = vec2(pos.x * 0.5 + 0.5, 0.5 - pos.y * 0.5);
    gl_Position = vec4(pos, 0.0, 1.0);
}
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::SoftwareBackend;
    use crate::types::Extent;

    #[test]
    fn substitutes_keyword_per_texture_kind() {
        let source = "texture(samplerPlaceholder0(a, s), uv) + texture(samplerPlaceholder1(b, s), uv)";
        let out = substitute_sampler_placeholders(
            source,
            &[SamplerKind::ExternalVideo, SamplerKind::Standard2d],
        )
        .unwrap();
        assert_eq!(
            out,
            "texture(videoSampler2D(a, s), uv) + texture(sampler2D(b, s), uv)"
        );
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let err = substitute_sampler_placeholders(
            "samplerPlaceholder0 samplerPlaceholder2",
            &[SamplerKind::Standard2d, SamplerKind::Standard2d],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RenderError::PlaceholderIndexOutOfRange {
                index: 2,
                available: 2
            }
        ));
    }

    #[test]
    fn bare_placeholder_is_malformed() {
        let err = substitute_sampler_placeholders("uniform samplerPlaceholder tex;", &[])
            .unwrap_err();
        assert!(matches!(err, RenderError::MalformedPlaceholder { offset: 8 }));
    }

    #[test]
    fn wrapped_fragment_declares_each_texture() {
        let wrapped = wrap_fragment("void main() {}", 2);
        assert!(wrapped.contains("binding = 1) uniform texture2D u_texture0;"));
        assert!(wrapped.contains("binding = 2) uniform texture2D u_texture1;"));
        assert!(!wrapped.contains("u_texture2"));
        assert!(wrapped.ends_with("void main() {}"));
    }

    #[test]
    fn builtin_programs_only_reference_bound_textures() {
        let video = [SamplerKind::ExternalVideo];
        let blend = [SamplerKind::ExternalVideo, SamplerKind::Standard2d];
        for (kind, textures) in [
            (ProgramKind::Preview, &video[..]),
            (ProgramKind::Accumulate, &blend[..]),
            (ProgramKind::Present, &[SamplerKind::Standard2d][..]),
        ] {
            let body = substitute_sampler_placeholders(fragment_body(kind), textures).unwrap();
            assert!(!body.contains("samplerPlaceholder"), "{kind:?}");
        }
    }

    #[test]
    fn placeholder_error_skips_compilation() {
        let mut backend = SoftwareBackend::new(Extent::new(4, 4));
        let err = build_program(&mut backend, ProgramKind::Accumulate, &[SamplerKind::ExternalVideo])
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::PlaceholderIndexOutOfRange {
                index: 1,
                available: 1
            }
        ));
        assert_eq!(backend.stats().programs_compiled, 0);
    }

    #[test]
    fn backend_compile_failure_is_propagated() {
        let mut backend = SoftwareBackend::new(Extent::new(4, 4));
        backend.fail_next_compile("0:3: 'outColour' : undeclared identifier");
        let err = build_program(&mut backend, ProgramKind::Present, &[SamplerKind::Standard2d])
            .unwrap_err();
        match err {
            RenderError::ShaderCompile { log, .. } => assert!(log.contains("undeclared")),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
