//! Pixel format conversion
//!
//! Decoded I420 frames are converted to RGBA for the paint surface. Scaling
//! and conversion happen in one pass: every destination pixel samples its
//! nearest source pixel through precomputed coordinate maps.

use serde::{Deserialize, Serialize};

// ============================================================================
// Color Spaces
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorSpace {
    BT601, // SD
    BT709, // HD
}

impl ColorSpace {
    /// Streams without signalled colour info: HD uses BT.709, SD uses BT.601
    pub fn for_resolution(_width: u32, height: u32) -> Self {
        if height >= 720 {
            Self::BT709
        } else {
            Self::BT601
        }
    }

    /// Returns (Wr, Wb) where Wg = 1 - Wr - Wb
    pub fn coefficients(&self) -> (f32, f32) {
        match self {
            Self::BT601 => (0.299, 0.114),
            Self::BT709 => (0.2126, 0.0722),
        }
    }

    /// Full-range YUV to RGB matrix
    pub fn yuv_to_rgb_matrix(&self) -> [[f32; 3]; 3] {
        let (wr, wb) = self.coefficients();
        let wg = 1.0 - wr - wb;

        // R = Y + 2*(1-Wr)*Cr
        // G = Y - 2*Wb*(1-Wb)/Wg*Cb - 2*Wr*(1-Wr)/Wg*Cr
        // B = Y + 2*(1-Wb)*Cb
        let cr_r = 2.0 * (1.0 - wr);
        let cb_g = -2.0 * wb * (1.0 - wb) / wg;
        let cr_g = -2.0 * wr * (1.0 - wr) / wg;
        let cb_b = 2.0 * (1.0 - wb);

        [[1.0, 0.0, cr_r], [1.0, cb_g, cr_g], [1.0, cb_b, 0.0]]
    }
}

// ============================================================================
// Scaler (coordinate maps)
// ============================================================================

/// Nearest-neighbour source coordinates for every destination row/column
#[derive(Debug, Clone)]
pub struct Scaler {
    src_width: usize,
    src_height: usize,
    dst_width: usize,
    dst_height: usize,
    x_map: Vec<usize>,
    y_map: Vec<usize>,
}

impl Scaler {
    pub fn new(src_width: usize, src_height: usize, dst_width: usize, dst_height: usize) -> Self {
        let x_map = (0..dst_width)
            .map(|x| (x * src_width / dst_width.max(1)).min(src_width.saturating_sub(1)))
            .collect();
        let y_map = (0..dst_height)
            .map(|y| (y * src_height / dst_height.max(1)).min(src_height.saturating_sub(1)))
            .collect();

        Self {
            src_width,
            src_height,
            dst_width,
            dst_height,
            x_map,
            y_map,
        }
    }

    pub fn matches(&self, src: (usize, usize), dst: (usize, usize)) -> bool {
        (self.src_width, self.src_height) == src && (self.dst_width, self.dst_height) == dst
    }
}

// ============================================================================
// Converter
// ============================================================================

/// I420 → RGBA converter with fixed-point (8.8) lookup tables, limited range input
pub struct YuvToRgba {
    color_space: ColorSpace,
    y_table: [i32; 256],
    u_table_g: [i32; 256],
    u_table_b: [i32; 256],
    v_table_r: [i32; 256],
    v_table_g: [i32; 256],
    scaler: Option<Scaler>,
}

impl YuvToRgba {
    pub fn new(color_space: ColorSpace) -> Self {
        let mut converter = Self {
            color_space,
            y_table: [0; 256],
            u_table_g: [0; 256],
            u_table_b: [0; 256],
            v_table_r: [0; 256],
            v_table_g: [0; 256],
            scaler: None,
        };
        converter.build_tables();
        converter
    }

    pub fn color_space(&self) -> ColorSpace {
        self.color_space
    }

    fn build_tables(&mut self) {
        let matrix = self.color_space.yuv_to_rgb_matrix();
        // Chroma excursion is 224 codes in limited range
        let chroma_scale = 255.0 / 224.0 * 256.0;

        for i in 0..256 {
            let y = i as i32 - 16;
            let uv = i as f32 - 128.0;

            self.y_table[i] = y * 298; // 255/219 ≈ 1.164
            self.u_table_g[i] = (uv * matrix[1][1] * chroma_scale).round() as i32;
            self.u_table_b[i] = (uv * matrix[2][1] * chroma_scale).round() as i32;
            self.v_table_r[i] = (uv * matrix[0][2] * chroma_scale).round() as i32;
            self.v_table_g[i] = (uv * matrix[1][2] * chroma_scale).round() as i32;
        }
    }

    #[inline]
    fn pixel(&self, y: u8, u: u8, v: u8) -> [u8; 4] {
        let luma = self.y_table[y as usize] + 128;
        let r = (luma + self.v_table_r[v as usize]) >> 8;
        let g = (luma + self.u_table_g[u as usize] + self.v_table_g[v as usize]) >> 8;
        let b = (luma + self.u_table_b[u as usize]) >> 8;
        [r.clamp(0, 255) as u8, g.clamp(0, 255) as u8, b.clamp(0, 255) as u8, 255]
    }

    /// Convert a packed I420 image into `dst` (RGBA, `dst_width` x `dst_height`).
    ///
    /// Returns false if the source planes are too small for the given size.
    pub fn convert_scaled(
        &mut self,
        (y_plane, u_plane, v_plane): (&[u8], &[u8], &[u8]),
        src_width: usize,
        src_height: usize,
        dst: &mut [u8],
        dst_width: usize,
        dst_height: usize,
    ) -> bool {
        let uv_width = src_width.div_ceil(2);
        if src_width == 0
            || src_height == 0
            || y_plane.len() < src_width * src_height
            || u_plane.len() < uv_width * src_height.div_ceil(2)
            || v_plane.len() < uv_width * src_height.div_ceil(2)
            || dst.len() < dst_width * dst_height * 4
        {
            return false;
        }

        let reuse = self
            .scaler
            .as_ref()
            .is_some_and(|s| s.matches((src_width, src_height), (dst_width, dst_height)));
        if !reuse {
            self.scaler = Some(Scaler::new(src_width, src_height, dst_width, dst_height));
        }
        let Some(scaler) = self.scaler.take() else {
            return false;
        };

        for (dst_y, &src_y) in scaler.y_map.iter().enumerate() {
            let y_row = src_y * src_width;
            let uv_row = (src_y / 2) * uv_width;
            let dst_row = dst_y * dst_width * 4;

            for (dst_x, &src_x) in scaler.x_map.iter().enumerate() {
                let uv_idx = uv_row + src_x / 2;
                let rgba = self.pixel(y_plane[y_row + src_x], u_plane[uv_idx], v_plane[uv_idx]);
                let idx = dst_row + dst_x * 4;
                dst[idx..idx + 4].copy_from_slice(&rgba);
            }
        }

        self.scaler = Some(scaler);
        true
    }
}
