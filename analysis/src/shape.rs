use core::{fmt, str::FromStr};

use smallvec::SmallVec;

/// The shape of an SSA value across the W lanes of a vectorized region.
///
/// Shapes form a join semi-lattice ordered as
///
/// ```text
/// Undef ⊑ Uniform ⊑ Contiguous ⊑ Strided ⊑ Varying
/// ```
///
/// * `Undef` is the _bottom_ state: nothing is known about the value yet. Callers must
///   not treat `Undef` as `Uniform`.
/// * `Uniform` values are identical in every lane (a stride of 0 per lane).
/// * `Contiguous` values increase by exactly 1 per lane.
/// * `Strided` values increase by a constant stride per lane. `Strided(0)` and
///   `Strided(1)` do not exist as such: they normalize to `Uniform` and `Contiguous`
///   on construction.
/// * `Varying` is the _top_ or _overdefined_ state: lanes are unrelated.
///
/// Every shape except `Undef` carries the alignment (in elements) of its lane-0 value;
/// alignments meet by greatest common divisor when shapes join.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum VectorShape {
    Undef,
    Uniform { align: u32 },
    Contiguous { align: u32 },
    Strided { stride: i32, align: u32 },
    Varying { align: u32 },
}

impl Default for VectorShape {
    fn default() -> Self {
        Self::Undef
    }
}

impl VectorShape {
    /// A uniform shape with unit alignment
    pub const fn uniform() -> Self {
        Self::Uniform { align: 1 }
    }

    /// A contiguous shape with unit alignment
    pub const fn contiguous() -> Self {
        Self::Contiguous { align: 1 }
    }

    /// A varying shape with unit alignment
    pub const fn varying() -> Self {
        Self::Varying { align: 1 }
    }

    /// A strided shape with unit alignment.
    ///
    /// Strides of 0 and 1 normalize to [Self::uniform] and [Self::contiguous].
    pub fn strided(stride: i32) -> Self {
        Self::strided_aligned(stride, 1)
    }

    pub fn strided_aligned(stride: i32, align: u32) -> Self {
        debug_assert!(align > 0, "alignment must be non-zero");
        match stride {
            0 => Self::Uniform { align },
            1 => Self::Contiguous { align },
            _ => Self::Strided { stride, align },
        }
    }

    /// Returns true if the value is known to be identical across lanes
    #[inline]
    pub fn is_uniform(&self) -> bool {
        matches!(self, Self::Uniform { .. })
    }

    /// Returns true if this shape carries any information, i.e. is not `Undef`
    #[inline]
    pub fn is_defined(&self) -> bool {
        !matches!(self, Self::Undef)
    }

    #[inline]
    pub fn is_varying(&self) -> bool {
        matches!(self, Self::Varying { .. })
    }

    /// Returns true if the per-lane values follow an affine progression, i.e. the shape
    /// is uniform, contiguous, or strided
    #[inline]
    pub fn has_stride(&self) -> bool {
        self.stride().is_some()
    }

    /// The per-lane stride, if the shape is affine: 0 for uniform, 1 for contiguous
    pub fn stride(&self) -> Option<i32> {
        match self {
            Self::Uniform { .. } => Some(0),
            Self::Contiguous { .. } => Some(1),
            Self::Strided { stride, .. } => Some(*stride),
            _ => None,
        }
    }

    /// The alignment of the lane-0 value; `Undef` has no alignment and reports 1
    pub fn alignment(&self) -> u32 {
        match self {
            Self::Undef => 1,
            Self::Uniform { align }
            | Self::Contiguous { align }
            | Self::Strided { align, .. }
            | Self::Varying { align } => *align,
        }
    }

    /// The same shape with its alignment replaced
    pub fn with_alignment(self, align: u32) -> Self {
        debug_assert!(align > 0, "alignment must be non-zero");
        match self {
            Self::Undef => Self::Undef,
            Self::Uniform { .. } => Self::Uniform { align },
            Self::Contiguous { .. } => Self::Contiguous { align },
            Self::Strided { stride, .. } => Self::Strided { stride, align },
            Self::Varying { .. } => Self::Varying { align },
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Undef => 0,
            Self::Uniform { .. } => 1,
            Self::Contiguous { .. } => 2,
            Self::Strided { .. } => 3,
            Self::Varying { .. } => 4,
        }
    }

    /// The least upper bound of two shapes.
    ///
    /// The higher-ranked shape wins and alignments meet by gcd; two strided shapes with
    /// different strides have no common affine description and join to `Varying`.
    pub fn join(self, other: Self) -> Self {
        let align = gcd(self.alignment(), other.alignment());
        let (lo, hi) = if self.rank() <= other.rank() {
            (self, other)
        } else {
            (other, self)
        };
        match (lo, hi) {
            (Self::Undef, shape) => shape,
            (Self::Strided { stride: s1, .. }, Self::Strided { stride: s2, .. }) if s1 != s2 => {
                Self::Varying { align }
            }
            (_, shape) => shape.with_alignment(align),
        }
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    let mut a = a;
    let mut b = b;
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

// ----------------------------------------------------------------------------------------
// Codec
//
// The human-readable grammar, used by drivers and tests to describe argument shapes:
//
//     shapes   := shape ( '_' shape )* ( 'r' shape )?
//     shape    := 'B' | ( 'U' | 'C' | 'T' | ( 'S' digit+ ) ) alignOpt
//     alignOpt := ( 'a' digit+ )?

/// The error produced when decoding an ill-formed shape string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeParseError {
    #[error("empty shape string")]
    Empty,
    #[error("unrecognized shape `{0}`")]
    UnknownShape(String),
    #[error("invalid stride in `{0}`")]
    InvalidStride(String),
    #[error("invalid alignment in `{0}`")]
    InvalidAlignment(String),
}

impl fmt::Display for VectorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undef => f.write_str("B"),
            Self::Uniform { .. } => f.write_str("U"),
            Self::Contiguous { .. } => f.write_str("C"),
            Self::Strided { stride, .. } => write!(f, "S{stride}"),
            Self::Varying { .. } => f.write_str("T"),
        }?;
        let align = self.alignment();
        if self.is_defined() && align != 1 {
            write!(f, "a{align}")?;
        }
        Ok(())
    }
}

impl FromStr for VectorShape {
    type Err = ShapeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars().peekable();
        let head = chars.next().ok_or(ShapeParseError::Empty)?;
        let shape = match head {
            'B' => {
                // `B` admits no alignment suffix
                if chars.next().is_some() {
                    return Err(ShapeParseError::UnknownShape(s.to_string()));
                }
                return Ok(Self::Undef);
            }
            'U' => Self::uniform(),
            'C' => Self::contiguous(),
            'T' => Self::varying(),
            'S' => {
                let digits: String =
                    core::iter::from_fn(|| chars.next_if(char::is_ascii_digit)).collect();
                let stride: i32 = digits
                    .parse()
                    .map_err(|_| ShapeParseError::InvalidStride(s.to_string()))?;
                Self::strided(stride)
            }
            _ => return Err(ShapeParseError::UnknownShape(s.to_string())),
        };
        match chars.next() {
            None => Ok(shape),
            Some('a') => {
                let digits: String =
                    core::iter::from_fn(|| chars.next_if(char::is_ascii_digit)).collect();
                if chars.next().is_some() {
                    return Err(ShapeParseError::InvalidAlignment(s.to_string()));
                }
                let align: u32 = digits
                    .parse()
                    .ok()
                    .filter(|a| *a > 0)
                    .ok_or_else(|| ShapeParseError::InvalidAlignment(s.to_string()))?;
                Ok(shape.with_alignment(align))
            }
            Some(_) => Err(ShapeParseError::UnknownShape(s.to_string())),
        }
    }
}

/// Decode a full shape string: `_`-separated argument shapes with an optional `r<shape>`
/// result-shape suffix.
///
/// Returns the argument shapes and the result shape, if one was given.
pub fn parse_shapes(
    s: &str,
) -> Result<(SmallVec<[VectorShape; 4]>, Option<VectorShape>), ShapeParseError> {
    if s.is_empty() {
        return Err(ShapeParseError::Empty);
    }
    // `r` cannot occur inside a shape, so the first occurrence splits off the result.
    let (args, result) = match s.find('r') {
        Some(at) => (&s[..at], Some(s[at + 1..].parse::<VectorShape>()?)),
        None => (s, None),
    };
    let mut shapes = SmallVec::new();
    for part in args.split('_') {
        shapes.push(part.parse::<VectorShape>()?);
    }
    Ok((shapes, result))
}
