//! Filmic HDR→SDR tone mapping.
//!
//! Both conversion strategies share one numeric contract: a linear
//! scene value in `[0, 16]` is sampled on a 1/1024 grid, compressed with
//! the Hable filmic curve, normalised so the white point maps to 1.0,
//! gamma encoded with the sRGB curve and quantised to 8 bits. The CPU
//! path reads the result from [`ToneMapLut`]; the compute shader in
//! `tonemap_cs.hlsl` evaluates the same expression per pixel.

use std::sync::OnceLock;

use crate::error::CaptureError;

/// Upper bound of the linear input range covered by the table.
pub const LUT_MAX_INPUT: f32 = 16.0;
/// Number of grid steps across `[0, LUT_MAX_INPUT]`.
pub const LUT_STEPS: usize = 16_384;
/// Table length, including both end points.
pub const LUT_LEN: usize = LUT_STEPS + 1;

const LUT_SCALE: f32 = LUT_STEPS as f32 / LUT_MAX_INPUT;

/// Hable ("Uncharted 2") filmic operator parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FilmicCurve {
    pub shoulder_strength: f32,
    pub linear_strength: f32,
    pub linear_angle: f32,
    pub toe_strength: f32,
    pub toe_numerator: f32,
    pub toe_denominator: f32,
    pub white_point: f32,
}

impl FilmicCurve {
    pub const HABLE: Self = Self {
        shoulder_strength: 0.15,
        linear_strength: 0.50,
        linear_angle: 0.10,
        toe_strength: 0.20,
        toe_numerator: 0.02,
        toe_denominator: 0.30,
        white_point: 11.2,
    };

    #[inline]
    pub fn eval(&self, x: f32) -> f32 {
        let a = self.shoulder_strength;
        let b = self.linear_strength;
        let c = self.linear_angle;
        let d = self.toe_strength;
        let e = self.toe_numerator;
        let f = self.toe_denominator;
        ((x * (a * x + c * b) + d * e) / (x * (a * x + b) + d * f)) - e / f
    }

    /// Scale that maps the white point to 1.0.
    #[inline]
    pub fn white_scale(&self) -> f32 {
        1.0 / self.eval(self.white_point)
    }
}

impl Default for FilmicCurve {
    fn default() -> Self {
        Self::HABLE
    }
}

/// sRGB transfer function (IEC 61966-2-1) for a linear value in `[0, 1]`.
#[inline]
pub fn srgb_encode(linear: f32) -> f32 {
    if linear <= 0.003_130_8 {
        linear * 12.92
    } else {
        1.055 * linear.powf(1.0 / 2.4) - 0.055
    }
}

/// Tone maps one grid-aligned linear value to an sRGB byte.
#[inline]
fn tonemap_to_byte(curve: &FilmicCurve, white_scale: f32, linear: f32) -> u8 {
    let mapped = curve.eval(linear) * white_scale;
    let encoded = srgb_encode(mapped.clamp(0.0, 1.0)).clamp(0.0, 1.0);
    (encoded * 255.0 + 0.5).floor() as u8
}

/// Immutable linear→sRGB table over `[0, 16]`.
pub struct ToneMapLut {
    table: Box<[u8; LUT_LEN]>,
}

impl ToneMapLut {
    pub fn build(curve: FilmicCurve) -> Self {
        let white_scale = curve.white_scale();
        let mut table = Box::new([0u8; LUT_LEN]);
        for (i, entry) in table.iter_mut().enumerate() {
            let linear = i as f32 / LUT_SCALE;
            *entry = tonemap_to_byte(&curve, white_scale, linear);
        }
        Self { table }
    }

    /// Process-wide table for [`FilmicCurve::HABLE`].
    pub fn global() -> &'static Self {
        static LUT: OnceLock<ToneMapLut> = OnceLock::new();
        LUT.get_or_init(|| Self::build(FilmicCurve::HABLE))
    }

    /// Maps one linear channel value. Negative and NaN inputs map to the
    /// first entry, inputs at or above 16.0 saturate to the last.
    #[inline(always)]
    pub fn map(&self, linear: f32) -> u8 {
        if !(linear > 0.0) {
            return self.table[0];
        }
        if linear >= LUT_MAX_INPUT {
            return self.table[LUT_STEPS];
        }
        let index = ((linear * LUT_SCALE) as usize).min(LUT_STEPS);
        self.table[index]
    }

    pub fn entries(&self) -> &[u8; LUT_LEN] {
        &self.table
    }
}

/// Which converter produced a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToneMapStrategy {
    /// BGRA8 source, copied without conversion.
    RawCopy,
    CpuLut,
    GpuCompute,
}

impl ToneMapStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RawCopy => "raw-copy",
            Self::CpuLut => "cpu-lut",
            Self::GpuCompute => "gpu-compute",
        }
    }

    pub(crate) const fn to_u8(self) -> u8 {
        match self {
            Self::RawCopy => 0,
            Self::CpuLut => 1,
            Self::GpuCompute => 2,
        }
    }

    pub(crate) const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::CpuLut,
            2 => Self::GpuCompute,
            _ => Self::RawCopy,
        }
    }
}

/// Consecutive GPU tone-map failures tolerated before the GPU path is
/// switched off for the rest of the session.
pub const GPU_TONEMAP_MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
enum GateState {
    Enabled { consecutive_failures: u32 },
    Disabled { reason: String },
}

/// Circuit breaker guarding the GPU compute strategy.
#[derive(Clone, Debug)]
pub(crate) struct GpuToneMapGate {
    state: GateState,
}

impl GpuToneMapGate {
    pub(crate) fn new(enabled: bool) -> Self {
        let state = if enabled {
            GateState::Enabled {
                consecutive_failures: 0,
            }
        } else {
            GateState::Disabled {
                reason: "not requested".into(),
            }
        };
        Self { state }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        matches!(self.state, GateState::Enabled { .. })
    }

    pub(crate) fn record_success(&mut self) {
        if let GateState::Enabled {
            consecutive_failures,
        } = &mut self.state
        {
            *consecutive_failures = 0;
        }
    }

    /// Records a failed GPU conversion. Returns `true` when this failure
    /// switched the gate off.
    pub(crate) fn record_failure(&mut self, error: &CaptureError) -> bool {
        let GateState::Enabled {
            consecutive_failures,
        } = &mut self.state
        else {
            return false;
        };

        let fatal_to_strategy = matches!(
            error,
            CaptureError::ShaderCompilation(_) | CaptureError::DeviceLost { .. }
        );
        *consecutive_failures += 1;
        if fatal_to_strategy || *consecutive_failures >= GPU_TONEMAP_MAX_CONSECUTIVE_FAILURES {
            self.state = GateState::Disabled {
                reason: error.to_string(),
            };
            return true;
        }
        false
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        match self.state {
            GateState::Enabled {
                consecutive_failures,
            } => consecutive_failures,
            GateState::Disabled { .. } => 0,
        }
    }

    pub(crate) fn disabled_reason(&self) -> Option<&str> {
        match &self.state {
            GateState::Disabled { reason } => Some(reason),
            GateState::Enabled { .. } => None,
        }
    }
}
