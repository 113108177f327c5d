// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! int8 仿射量化辅助函数

#[inline]
pub fn dequantize(q: i8, zero_point: i32, scale: f32) -> f32 {
    (q as i32 - zero_point) as f32 * scale
}

#[inline]
pub fn quantize(v: f32, zero_point: i32, scale: f32) -> i8 {
    let q = (v / scale).round() as i32 + zero_point;
    q.clamp(i8::MIN as i32, i8::MAX as i32) as i8
}

/// 覆盖 [lo, hi] 的量化参数 (scale, zero_point)
pub fn params_for_range(lo: f32, hi: f32) -> (f32, i32) {
    let (lo, hi) = (lo.min(0.0), hi.max(0.0));
    let scale = ((hi - lo) / 255.0).max(f32::EPSILON);
    let zero_point = (-128.0 - lo / scale).round() as i32;
    (scale, zero_point.clamp(-128, 127))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_params_cover_endpoints() {
        let (scale, zp) = params_for_range(0.0, 1.0);
        assert_eq!(zp, -128);
        assert!((dequantize(quantize(0.0, zp, scale), zp, scale)).abs() < 1e-6);
        assert!((dequantize(quantize(1.0, zp, scale), zp, scale) - 1.0).abs() < scale);
        assert!((dequantize(quantize(0.37, zp, scale), zp, scale) - 0.37).abs() <= scale / 2.0);
    }

    #[test]
    fn quantize_saturates() {
        assert_eq!(quantize(1e6, 0, 1.0), i8::MAX);
        assert_eq!(quantize(-1e6, 0, 1.0), i8::MIN);
    }
}
