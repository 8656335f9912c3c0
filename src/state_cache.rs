//! State-object deduplication.
//!
//! Fixed-function settings pack into 64-bit keys with fixed bit ranges per
//! field; every backend keys its native state objects (or pipelines) by these
//! values. Identical settings therefore always resolve to one refcounted
//! native object per cache, and an entry is destroyed exactly when the last
//! renderable using it unbinds.
//!
//! The encode is versioned: the top nibble of every key carries
//! [`KEY_VERSION`], and `const_assert!` ties each field's width to the
//! cardinality of the enum it encodes, so growing an enum past its field is a
//! compile error, never a silent collision.

use std::collections::HashMap;
use std::hash::Hash;

use static_assertions::const_assert;

use crate::error::RhiResult;
use crate::mesh::{VertexAttributeFormat, VertexLayout, VertexSemantic, MAX_VERTEX_ATTRIBUTES};
use crate::types::{
    AddressMode, BlendComponent, BlendFactor, BlendOperation, CompareFunction, CullMode,
    FilterMode, FrontFace, RenderState, SamplerDescriptor, StencilOperation, StencilState,
};

/// Bump when any field layout below changes.
pub const KEY_VERSION: u64 = 1;
const VERSION_SHIFT: u64 = 60;
const_assert!(KEY_VERSION < 1 << 4);

const CULL_MODE_BITS: u64 = 2;
const FRONT_FACE_BITS: u64 = 1;
const COMPARE_BITS: u64 = 4;
const BLEND_FACTOR_BITS: u64 = 4;
const BLEND_OP_BITS: u64 = 3;
const STENCIL_OP_BITS: u64 = 3;
const WRITE_MASK_BITS: u64 = 4;
const FILTER_BITS: u64 = 1;
const ADDRESS_BITS: u64 = 2;
const SEMANTIC_BITS: u64 = 3;
const VERTEX_FORMAT_BITS: u64 = 4;

// Exhaustive matches below are the growth detector: a new enum variant must
// be given a bit pattern here, and the const_assert on its maximum keeps the
// pattern inside the field.

const fn cull_mode_bits(mode: CullMode) -> u64 {
    match mode {
        CullMode::None => 0,
        CullMode::Front => 1,
        CullMode::Back => 2,
    }
}
const_assert!(cull_mode_bits(CullMode::Back) < 1 << CULL_MODE_BITS);

const fn front_face_bits(face: FrontFace) -> u64 {
    match face {
        FrontFace::Ccw => 0,
        FrontFace::Cw => 1,
    }
}
const_assert!(front_face_bits(FrontFace::Cw) < 1 << FRONT_FACE_BITS);

const fn compare_bits(func: CompareFunction) -> u64 {
    match func {
        CompareFunction::Never => 0,
        CompareFunction::Less => 1,
        CompareFunction::Equal => 2,
        CompareFunction::LessEqual => 3,
        CompareFunction::Greater => 4,
        CompareFunction::NotEqual => 5,
        CompareFunction::GreaterEqual => 6,
        CompareFunction::Always => 7,
    }
}
const_assert!(compare_bits(CompareFunction::Always) < 1 << COMPARE_BITS);

const fn blend_factor_bits(factor: BlendFactor) -> u64 {
    match factor {
        BlendFactor::Zero => 0,
        BlendFactor::One => 1,
        BlendFactor::Src => 2,
        BlendFactor::OneMinusSrc => 3,
        BlendFactor::SrcAlpha => 4,
        BlendFactor::OneMinusSrcAlpha => 5,
        BlendFactor::Dst => 6,
        BlendFactor::OneMinusDst => 7,
        BlendFactor::DstAlpha => 8,
        BlendFactor::OneMinusDstAlpha => 9,
    }
}
const_assert!(blend_factor_bits(BlendFactor::OneMinusDstAlpha) < 1 << BLEND_FACTOR_BITS);

const fn blend_op_bits(op: BlendOperation) -> u64 {
    match op {
        BlendOperation::Add => 0,
        BlendOperation::Subtract => 1,
        BlendOperation::ReverseSubtract => 2,
        BlendOperation::Min => 3,
        BlendOperation::Max => 4,
    }
}
const_assert!(blend_op_bits(BlendOperation::Max) < 1 << BLEND_OP_BITS);

const fn stencil_op_bits(op: StencilOperation) -> u64 {
    match op {
        StencilOperation::Keep => 0,
        StencilOperation::Zero => 1,
        StencilOperation::Replace => 2,
        StencilOperation::Invert => 3,
        StencilOperation::IncrementClamp => 4,
        StencilOperation::DecrementClamp => 5,
        StencilOperation::IncrementWrap => 6,
        StencilOperation::DecrementWrap => 7,
    }
}
const_assert!(stencil_op_bits(StencilOperation::DecrementWrap) < 1 << STENCIL_OP_BITS);

const fn filter_bits(filter: FilterMode) -> u64 {
    match filter {
        FilterMode::Nearest => 0,
        FilterMode::Linear => 1,
    }
}
const_assert!(filter_bits(FilterMode::Linear) < 1 << FILTER_BITS);

const fn address_bits(mode: AddressMode) -> u64 {
    match mode {
        AddressMode::Repeat => 0,
        AddressMode::MirrorRepeat => 1,
        AddressMode::ClampToEdge => 2,
    }
}
const_assert!(address_bits(AddressMode::ClampToEdge) < 1 << ADDRESS_BITS);

const fn semantic_bits(semantic: VertexSemantic) -> u64 {
    match semantic {
        VertexSemantic::Position => 0,
        VertexSemantic::Normal => 1,
        VertexSemantic::Tangent => 2,
        VertexSemantic::Color => 3,
        VertexSemantic::TexCoord0 => 4,
        VertexSemantic::TexCoord1 => 5,
    }
}
const_assert!(semantic_bits(VertexSemantic::TexCoord1) < 1 << SEMANTIC_BITS);

const fn vertex_format_bits(format: VertexAttributeFormat) -> u64 {
    match format {
        VertexAttributeFormat::Float32 => 0,
        VertexAttributeFormat::Float32x2 => 1,
        VertexAttributeFormat::Float32x3 => 2,
        VertexAttributeFormat::Float32x4 => 3,
        VertexAttributeFormat::Unorm8 => 4,
        VertexAttributeFormat::Unorm8x2 => 5,
        VertexAttributeFormat::Unorm8x4 => 6,
    }
}
const_assert!(vertex_format_bits(VertexAttributeFormat::Unorm8x4) < 1 << VERTEX_FORMAT_BITS);

fn with_version(bits: u64) -> u64 {
    debug_assert_eq!(bits >> VERSION_SHIFT, 0);
    bits | (KEY_VERSION << VERSION_SHIFT)
}

/// Rasterizer state key: cull mode and front face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RasterizerKey(u64);

impl RasterizerKey {
    pub fn pack(cull_mode: CullMode, front_face: FrontFace) -> Self {
        let bits = cull_mode_bits(cull_mode) | (front_face_bits(front_face) << CULL_MODE_BITS);
        Self(with_version(bits))
    }

    pub fn from_state(state: &RenderState) -> Self {
        Self::pack(state.cull_mode, state.front_face)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// Blend state key: enable bit, color and alpha equations, write mask.
/// Disabled blending packs zeroed equations so it has one canonical key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlendKey(u64);

impl BlendKey {
    pub fn from_state(state: &RenderState) -> Self {
        let mut bits = 0u64;
        let mut shift = 0u64;
        let mut push = |value: u64, width: u64| {
            bits |= value << shift;
            shift += width;
        };

        push(state.blend.is_some() as u64, 1);
        let component_bits = |c: &BlendComponent| {
            (
                blend_factor_bits(c.src_factor),
                blend_factor_bits(c.dst_factor),
                blend_op_bits(c.operation),
            )
        };
        let (color, alpha) = match &state.blend {
            Some(blend) => (component_bits(&blend.color), component_bits(&blend.alpha)),
            None => ((0, 0, 0), (0, 0, 0)),
        };
        for (src, dst, op) in [color, alpha] {
            push(src, BLEND_FACTOR_BITS);
            push(dst, BLEND_FACTOR_BITS);
            push(op, BLEND_OP_BITS);
        }
        push(state.color_write_mask.bits() as u64, WRITE_MASK_BITS);

        debug_assert!(shift <= VERSION_SHIFT);
        Self(with_version(bits))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// Depth-stencil state key. A disabled stencil packs as zeroes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DepthStencilKey(u64);

impl DepthStencilKey {
    pub fn from_state(state: &RenderState) -> Self {
        let mut bits = 0u64;
        let mut shift = 0u64;
        let mut push = |value: u64, width: u64| {
            bits |= value << shift;
            shift += width;
        };

        push(compare_bits(state.depth_compare), COMPARE_BITS);
        push(state.depth_write as u64, 1);
        push(state.stencil.is_some() as u64, 1);
        let stencil = state.stencil.unwrap_or(StencilState {
            compare: CompareFunction::Never,
            fail_op: StencilOperation::Keep,
            depth_fail_op: StencilOperation::Keep,
            pass_op: StencilOperation::Keep,
            read_mask: 0,
            write_mask: 0,
        });
        push(compare_bits(stencil.compare), COMPARE_BITS);
        push(stencil_op_bits(stencil.fail_op), STENCIL_OP_BITS);
        push(stencil_op_bits(stencil.depth_fail_op), STENCIL_OP_BITS);
        push(stencil_op_bits(stencil.pass_op), STENCIL_OP_BITS);
        push(stencil.read_mask as u64, 8);
        push(stencil.write_mask as u64, 8);

        debug_assert!(shift <= VERSION_SHIFT);
        Self(with_version(bits))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// Sampler state key: filters, addressing and the optional compare function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SamplerKey(u64);

impl SamplerKey {
    pub fn pack(desc: &SamplerDescriptor) -> Self {
        let mut bits = 0u64;
        let mut shift = 0u64;
        let mut push = |value: u64, width: u64| {
            bits |= value << shift;
            shift += width;
        };

        push(filter_bits(desc.min_filter), FILTER_BITS);
        push(filter_bits(desc.mag_filter), FILTER_BITS);
        push(filter_bits(desc.mip_filter), FILTER_BITS);
        push(address_bits(desc.address_u), ADDRESS_BITS);
        push(address_bits(desc.address_v), ADDRESS_BITS);
        push(address_bits(desc.address_w), ADDRESS_BITS);
        push(desc.compare.is_some() as u64, 1);
        push(
            compare_bits(desc.compare.unwrap_or(CompareFunction::Never)),
            COMPARE_BITS,
        );

        debug_assert!(shift <= VERSION_SHIFT);
        Self(with_version(bits))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// Input-layout key: attribute count plus (semantic, format) per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputLayoutKey(u64);

const ATTRIBUTE_BITS: u64 = SEMANTIC_BITS + VERTEX_FORMAT_BITS;
const_assert!(4 + ATTRIBUTE_BITS * MAX_VERTEX_ATTRIBUTES as u64 <= VERSION_SHIFT);

impl InputLayoutKey {
    pub fn pack(layout: &VertexLayout) -> Self {
        let attributes = layout.attributes();
        debug_assert!(attributes.len() <= MAX_VERTEX_ATTRIBUTES);
        let mut bits = attributes.len() as u64;
        for (i, attribute) in attributes.iter().enumerate() {
            let slot = semantic_bits(attribute.semantic)
                | (vertex_format_bits(attribute.format) << SEMANTIC_BITS);
            bits |= slot << (4 + ATTRIBUTE_BITS * i as u64);
        }
        Self(with_version(bits))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

struct CacheEntry<H> {
    handle: H,
    refcount: u32,
}

/// A refcounted map from packed key to native state object.
///
/// There is no time- or capacity-based eviction: entries live exactly as long
/// as a bound renderable references them. Each backend owns its caches; they
/// are never shared between instances.
pub struct StateCache<K, H> {
    entries: HashMap<K, CacheEntry<H>>,
}

impl<K: Copy + Eq + Hash + std::fmt::Debug, H: Clone> StateCache<K, H> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Returns the native object for `key`, creating it on first use.
    /// Increments the reference count either way.
    pub fn acquire(&mut self, key: K, create: impl FnOnce() -> RhiResult<H>) -> RhiResult<H> {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.refcount += 1;
            return Ok(entry.handle.clone());
        }
        let handle = create()?;
        self.entries.insert(
            key,
            CacheEntry {
                handle: handle.clone(),
                refcount: 1,
            },
        );
        Ok(handle)
    }

    /// Drops one reference; at zero the entry is removed and `destroy` runs
    /// with the native object. Releasing an unknown key is tolerated (logged)
    /// so a degraded bind cannot escalate during teardown.
    pub fn release(&mut self, key: K, destroy: impl FnOnce(H)) {
        match self.entries.get_mut(&key) {
            Some(entry) if entry.refcount > 1 => {
                entry.refcount -= 1;
            }
            Some(_) => {
                if let Some(entry) = self.entries.remove(&key) {
                    destroy(entry.handle);
                }
            }
            None => {
                log::warn!("release of unknown state key {key:?}");
            }
        }
    }

    /// Looks up without touching the reference count.
    pub fn get(&self, key: K) -> Option<H> {
        self.entries.get(&key).map(|e| e.handle.clone())
    }

    pub fn refcount(&self, key: K) -> u32 {
        self.entries.get(&key).map_or(0, |e| e.refcount)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates the live native objects, for backend teardown.
    pub fn drain(&mut self) -> impl Iterator<Item = H> + '_ {
        self.entries.drain().map(|(_, e)| e.handle)
    }
}

impl<K: Copy + Eq + Hash + std::fmt::Debug, H: Clone> Default for StateCache<K, H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::VertexAttribute;
    use crate::types::{BlendState, ColorWrites};
    use std::collections::HashSet;

    const ALL_CULL: [CullMode; 3] = [CullMode::None, CullMode::Front, CullMode::Back];
    const ALL_FACTORS: [BlendFactor; 10] = [
        BlendFactor::Zero,
        BlendFactor::One,
        BlendFactor::Src,
        BlendFactor::OneMinusSrc,
        BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSrcAlpha,
        BlendFactor::Dst,
        BlendFactor::OneMinusDst,
        BlendFactor::DstAlpha,
        BlendFactor::OneMinusDstAlpha,
    ];
    const ALL_OPS: [BlendOperation; 5] = [
        BlendOperation::Add,
        BlendOperation::Subtract,
        BlendOperation::ReverseSubtract,
        BlendOperation::Min,
        BlendOperation::Max,
    ];
    const ALL_COMPARE: [CompareFunction; 8] = [
        CompareFunction::Never,
        CompareFunction::Less,
        CompareFunction::Equal,
        CompareFunction::LessEqual,
        CompareFunction::Greater,
        CompareFunction::NotEqual,
        CompareFunction::GreaterEqual,
        CompareFunction::Always,
    ];

    #[test]
    fn test_rasterizer_keys_injective() {
        let mut seen = HashSet::new();
        for cull in ALL_CULL {
            for face in [FrontFace::Ccw, FrontFace::Cw] {
                assert!(seen.insert(RasterizerKey::pack(cull, face)));
            }
        }
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_blend_color_component_injective() {
        let mut seen = HashSet::new();
        for src in ALL_FACTORS {
            for dst in ALL_FACTORS {
                for op in ALL_OPS {
                    let state = RenderState {
                        blend: Some(BlendState {
                            color: BlendComponent {
                                src_factor: src,
                                dst_factor: dst,
                                operation: op,
                            },
                            alpha: BlendComponent::REPLACE,
                        }),
                        ..RenderState::default()
                    };
                    assert!(seen.insert(BlendKey::from_state(&state)));
                }
            }
        }
        assert_eq!(seen.len(), 500);
    }

    #[test]
    fn test_blend_alpha_and_mask_injective() {
        let mut seen = HashSet::new();
        for src in ALL_FACTORS {
            for op in ALL_OPS {
                for mask in 0u32..16 {
                    let state = RenderState {
                        blend: Some(BlendState {
                            color: BlendComponent::REPLACE,
                            alpha: BlendComponent {
                                src_factor: src,
                                dst_factor: BlendFactor::One,
                                operation: op,
                            },
                        }),
                        color_write_mask: ColorWrites::from_bits_truncate(mask),
                        ..RenderState::default()
                    };
                    assert!(seen.insert(BlendKey::from_state(&state)));
                }
            }
        }
    }

    #[test]
    fn test_disabled_blend_is_canonical() {
        let a = BlendKey::from_state(&RenderState::default());
        let b = BlendKey::from_state(&RenderState {
            blend: None,
            ..RenderState::default()
        });
        assert_eq!(a, b);
        let enabled = BlendKey::from_state(&RenderState {
            blend: Some(BlendState::alpha_blending()),
            ..RenderState::default()
        });
        assert_ne!(a, enabled);
    }

    #[test]
    fn test_depth_stencil_keys_injective() {
        let mut seen = HashSet::new();
        for compare in ALL_COMPARE {
            for write in [false, true] {
                for stencil in [None, Some(StencilState::default())] {
                    let state = RenderState {
                        depth_compare: compare,
                        depth_write: write,
                        stencil,
                        ..RenderState::default()
                    };
                    assert!(seen.insert(DepthStencilKey::from_state(&state)));
                }
            }
        }
        assert_eq!(seen.len(), 32);
    }

    #[test]
    fn test_stencil_masks_packed() {
        let base = RenderState {
            stencil: Some(StencilState::default()),
            ..RenderState::default()
        };
        let masked = RenderState {
            stencil: Some(StencilState {
                read_mask: 0x0f,
                ..StencilState::default()
            }),
            ..RenderState::default()
        };
        assert_ne!(
            DepthStencilKey::from_state(&base),
            DepthStencilKey::from_state(&masked)
        );
    }

    #[test]
    fn test_sampler_keys_injective() {
        let filters = [FilterMode::Nearest, FilterMode::Linear];
        let addresses = [
            AddressMode::Repeat,
            AddressMode::MirrorRepeat,
            AddressMode::ClampToEdge,
        ];
        let mut seen = HashSet::new();
        for min in filters {
            for mag in filters {
                for au in addresses {
                    for av in addresses {
                        for compare in [None, Some(CompareFunction::Less)] {
                            let desc = SamplerDescriptor {
                                min_filter: min,
                                mag_filter: mag,
                                address_u: au,
                                address_v: av,
                                compare,
                                ..SamplerDescriptor::default()
                            };
                            assert!(seen.insert(SamplerKey::pack(&desc)));
                        }
                    }
                }
            }
        }
        assert_eq!(seen.len(), 2 * 2 * 3 * 3 * 2);
    }

    #[test]
    fn test_input_layout_order_matters() {
        let position = VertexAttribute {
            semantic: VertexSemantic::Position,
            format: VertexAttributeFormat::Float32x3,
        };
        let uv = VertexAttribute {
            semantic: VertexSemantic::TexCoord0,
            format: VertexAttributeFormat::Float32x2,
        };
        let a = InputLayoutKey::pack(&VertexLayout::new(vec![position, uv]).unwrap());
        let b = InputLayoutKey::pack(&VertexLayout::new(vec![uv, position]).unwrap());
        let c = InputLayoutKey::pack(&VertexLayout::new(vec![position]).unwrap());
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(
            a,
            InputLayoutKey::pack(&VertexLayout::new(vec![position, uv]).unwrap())
        );
    }

    #[test]
    fn test_keys_carry_version() {
        let key = RasterizerKey::from_state(&RenderState::default());
        assert_eq!(key.value() >> 60, KEY_VERSION);
    }

    #[test]
    fn test_cache_refcount_lifecycle() {
        let mut cache: StateCache<RasterizerKey, u64> = StateCache::new();
        let key = RasterizerKey::pack(CullMode::Back, FrontFace::Ccw);

        let first = cache.acquire(key, || Ok(7)).unwrap();
        let second = cache.acquire(key, || panic!("must reuse cached handle")).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.refcount(key), 2);
        assert_eq!(cache.len(), 1);

        let mut destroyed = Vec::new();
        cache.release(key, |h| destroyed.push(h));
        assert_eq!(cache.refcount(key), 1);
        assert!(destroyed.is_empty());

        cache.release(key, |h| destroyed.push(h));
        assert_eq!(destroyed, vec![7]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_release_unknown_key_is_tolerated() {
        let mut cache: StateCache<RasterizerKey, u64> = StateCache::new();
        cache.release(RasterizerKey::pack(CullMode::None, FrontFace::Cw), |_| {
            panic!("nothing to destroy")
        });
        assert!(cache.is_empty());
    }
}
