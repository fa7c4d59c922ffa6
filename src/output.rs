//! Host output metrics as presented to guest clients
//!
//! Outputs are rewritten before the guest sees them. Xwayland always gets
//! scale 1 with modes sized for the relay scale, and every output placed at
//! the origin so managed windows stay centered. Native clients get an
//! integer output scale. Optional DPI buckets snap the reported physical
//! size so X toolkits pick sensible font sizes.

use crate::geometry::{MAX_SCALE, MIN_SCALE};
use log::warn;

pub const INCH_IN_MM: f64 = 25.4;

/// Largest `wl_output.scale` reported to native clients
pub const MAX_OUTPUT_SCALE: i32 = 2;

/// Cursor size at scale 1
pub const XCURSOR_SIZE_BASE: f64 = 24.0;

pub const DEFAULT_DPI_BUCKETS: [i32; 6] = [72, 96, 160, 240, 320, 480];

pub const WL_OUTPUT_MODE_CURRENT: u32 = 1;

/// `zaura_output.scale` flags
pub const AURA_SCALE_PROPERTY_CURRENT: u32 = 1;
pub const AURA_SCALE_PROPERTY_PREFERRED: u32 = 2;

/// `zaura_output.connection` internal panel
pub const AURA_CONNECTION_INTERNAL: u32 = 1;

/// Aura scale factors the host is known to send, in thousandths
const AURA_SCALE_FACTORS: [u32; 36] = [
    400, 500, 550, 600, 625, 650, 700, 750, 800, 850, 900, 950, 1000, 1050, 1100, 1125, 1150, 1200,
    1250, 1300, 1400, 1450, 1500, 1600, 1750, 1800, 2000, 2200, 2250, 2500, 2750, 3000, 3500,
    4000, 4500, 5000,
];

/// Aura factors are scale × 1000
fn aura_factor(value: u32) -> f64 {
    value as f64 / 1000.0
}

/// What the host last told us about one output
#[derive(Debug, Clone, PartialEq)]
pub struct HostOutput {
    pub x: i32,
    pub y: i32,
    pub physical_width: i32,
    pub physical_height: i32,
    pub subpixel: i32,
    pub make: String,
    pub model: String,
    pub transform: i32,
    pub mode_flags: u32,
    pub width: i32,
    pub height: i32,
    pub refresh: i32,
    pub scale_factor: i32,
    pub current_scale: u32,
    pub preferred_scale: u32,
    pub device_scale_factor: u32,
    /// Waiting for an aura scale event before reporting
    pub expecting_scale: bool,
    pub internal: bool,
    pub has_aura_output: bool,
}

impl HostOutput {
    /// A fresh output; the first one bound is assumed to be the internal panel
    pub fn new(internal: bool, aura: bool) -> Self {
        Self {
            x: 0,
            y: 0,
            physical_width: 0,
            physical_height: 0,
            subpixel: 0,
            make: "unknown".into(),
            model: "unknown".into(),
            transform: 0,
            mode_flags: 0,
            width: 1024,
            height: 768,
            refresh: 60000,
            scale_factor: 1,
            current_scale: 1000,
            preferred_scale: 1000,
            device_scale_factor: 1000,
            expecting_scale: aura,
            internal,
            has_aura_output: aura,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_geometry(
        &mut self,
        x: i32,
        y: i32,
        physical_width: i32,
        physical_height: i32,
        subpixel: i32,
        make: String,
        model: String,
        transform: i32,
    ) {
        self.x = x;
        self.y = y;
        self.physical_width = physical_width;
        self.physical_height = physical_height;
        self.subpixel = subpixel;
        self.make = make;
        self.model = model;
        self.transform = transform;
    }

    pub fn set_mode(&mut self, flags: u32, width: i32, height: i32, refresh: i32) {
        self.mode_flags = flags;
        self.width = width;
        self.height = height;
        self.refresh = refresh;
    }

    pub fn set_scale(&mut self, scale_factor: i32) {
        self.scale_factor = scale_factor;
    }

    pub fn aura_scale(&mut self, flags: u32, scale: u32) {
        if !AURA_SCALE_FACTORS.contains(&scale) {
            warn!("Unknown aura scale factor: {}", scale);
        }
        if flags & AURA_SCALE_PROPERTY_CURRENT != 0 {
            self.current_scale = scale;
        }
        if flags & AURA_SCALE_PROPERTY_PREFERRED != 0 {
            self.preferred_scale = scale;
        }
        self.expecting_scale = false;
    }

    pub fn aura_connection(&mut self, connection: u32) {
        self.internal = connection == AURA_CONNECTION_INTERNAL;
    }

    pub fn aura_device_scale_factor(&mut self, factor: u32) {
        self.device_scale_factor = factor;
    }

    /// `wl_output.done` from the host; returns whether to report the state now
    pub fn done(&mut self) -> bool {
        if self.expecting_scale {
            return false;
        }
        if self.has_aura_output {
            self.expecting_scale = true;
        }
        true
    }

    /// Metrics to send to the guest
    pub fn guest_state(&self, ctx: &OutputContext<'_>) -> OutputState {
        let mut ideal_scale_factor = 1.0;
        let mut scale_factor = self.scale_factor as f64;
        if ctx.aura {
            let device = aura_factor(self.device_scale_factor);
            ideal_scale_factor = device * aura_factor(self.preferred_scale);
            scale_factor = device * aura_factor(self.current_scale);
        }
        if scale_factor <= 0.0 {
            scale_factor = 1.0;
        }

        let (scale, mut physical_width, mut physical_height, x, y, width, height);
        if ctx.xwayland {
            scale = 1;
            physical_width = (self.physical_width as f64 * ideal_scale_factor / scale_factor) as i32;
            physical_height = (self.physical_height as f64 * ideal_scale_factor / scale_factor) as i32;
            // Outputs overlap at the origin, managed windows stay centered
            x = 0;
            y = 0;
            width = (self.width as f64 * ctx.scale / scale_factor) as i32;
            height = (self.height as f64 * ctx.scale / scale_factor) as i32;
        } else {
            scale = ((scale_factor / ctx.scale).ceil() as i32).min(MAX_OUTPUT_SCALE);
            physical_width = self.physical_width;
            physical_height = self.physical_height;
            x = self.x;
            y = self.y;
            width = (self.width as f64 * ctx.scale * scale as f64 / scale_factor) as i32;
            height = (self.height as f64 * ctx.scale * scale as f64 / scale_factor) as i32;
        }

        if let Some(dpi) = snap_dpi(ctx.dpi, width, physical_width) {
            let mm_per_dot = INCH_IN_MM / dpi as f64;
            physical_width = (width as f64 * mm_per_dot + 0.5) as i32;
            physical_height = (height as f64 * mm_per_dot + 0.5) as i32;
        }

        OutputState {
            x,
            y,
            physical_width,
            physical_height,
            subpixel: self.subpixel,
            make: self.make.clone(),
            model: self.model.clone(),
            transform: self.transform,
            mode_flags: self.mode_flags | WL_OUTPUT_MODE_CURRENT,
            width,
            height,
            refresh: self.refresh,
            scale,
        }
    }
}

/// Relay-wide inputs to output rewriting
#[derive(Debug, Clone, Copy)]
pub struct OutputContext<'a> {
    pub xwayland: bool,
    pub aura: bool,
    pub scale: f64,
    /// Ascending DPI buckets; empty disables snapping
    pub dpi: &'a [i32],
}

/// The rewritten `geometry`, `mode` and `scale` events
#[derive(Debug, Clone, PartialEq)]
pub struct OutputState {
    pub x: i32,
    pub y: i32,
    pub physical_width: i32,
    pub physical_height: i32,
    pub subpixel: i32,
    pub make: String,
    pub model: String,
    pub transform: i32,
    pub mode_flags: u32,
    pub width: i32,
    pub height: i32,
    pub refresh: i32,
    pub scale: i32,
}

/// Largest bucket not above the measured DPI, or the first bucket
fn snap_dpi(buckets: &[i32], width: i32, physical_width: i32) -> Option<i32> {
    let first = *buckets.first()?;
    let dpi = if physical_width > 0 {
        (width as f64 * INCH_IN_MM / physical_width as f64) as i32
    } else {
        0
    };
    Some(
        buckets
            .iter()
            .copied()
            .take_while(|bucket| *bucket <= dpi)
            .last()
            .unwrap_or(first),
    )
}

/// Scale used for Xwayland, from the internal output's preferred density
pub fn xwayland_scale<'a>(
    outputs: impl IntoIterator<Item = &'a HostOutput>,
    desired: f64,
    aura: bool,
    viewport: bool,
) -> f64 {
    let default_scale_factor = outputs
        .into_iter()
        .find(|output| output.internal)
        .filter(|_| aura)
        .map(|output| aura_factor(output.device_scale_factor) * aura_factor(output.preferred_scale))
        .unwrap_or(1.0);

    let mut scale = desired * default_scale_factor;
    if !viewport {
        scale = scale.round();
    }
    scale.clamp(MIN_SCALE, MAX_SCALE)
}

/// `XCURSOR_SIZE` for a relay scale
pub fn xcursor_size(scale: f64) -> i32 {
    (XCURSOR_SIZE_BASE * scale + 0.5) as i32
}
