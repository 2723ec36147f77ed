//! 像素缓冲与压缩传输
//!
//! 读出的 16 位样本按行优先排列。网络传输时：
//! `u16` 小端字节 → LZ4（前置原始长度）→ base64，嵌入响应 payload。
//! 解压时按声明的宽高校验样本数，严格还原原始布局。

use crate::error::ProtocolError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// 当前唯一支持的像素编码
pub const PIXEL_ENCODING: &str = "lz4+base64";

/// 行优先的 16 位像素缓冲
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    samples: Vec<u16>,
}

impl PixelBuffer {
    /// 由样本构造；样本数必须等于 `width × height`
    pub fn new(width: u32, height: u32, samples: Vec<u16>) -> Result<Self, ProtocolError> {
        let expected = width as usize * height as usize;
        if samples.len() != expected {
            return Err(ProtocolError::SampleCountMismatch {
                expected,
                actual: samples.len() * 2,
            });
        }
        Ok(Self {
            width,
            height,
            samples,
        })
    }

    /// 全零缓冲
    pub fn zeroed(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            samples: vec![0; width as usize * height as usize],
        }
    }

    /// 按坐标生成样本
    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> u16) -> Self {
        let mut samples = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                samples.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            samples,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn samples(&self) -> &[u16] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<u16> {
        self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// 读取 `(x, y)` 处的样本
    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.samples
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    fn swap(&mut self, a: (u32, u32), b: (u32, u32)) {
        let w = self.width as usize;
        let ia = a.1 as usize * w + a.0 as usize;
        let ib = b.1 as usize * w + b.0 as usize;
        self.samples.swap(ia, ib);
    }

    /// 小端字节序列
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    /// 压缩为可嵌入 JSON 的形式
    pub fn compress(&self) -> CompressedPixels {
        let compressed = lz4_flex::compress_prepend_size(&self.to_le_bytes());
        CompressedPixels {
            width: self.width,
            height: self.height,
            encoding: PIXEL_ENCODING.to_string(),
            data: BASE64.encode(compressed),
        }
    }
}

/// `read-pixels` 的响应 payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedPixels {
    pub width: u32,
    pub height: u32,
    pub encoding: String,
    pub data: String,
}

impl CompressedPixels {
    /// 还原像素缓冲
    pub fn decompress(&self) -> Result<PixelBuffer, ProtocolError> {
        if self.encoding != PIXEL_ENCODING {
            return Err(ProtocolError::UnsupportedEncoding(self.encoding.clone()));
        }

        let expected = self.width as usize * self.height as usize;
        let compressed = BASE64.decode(self.data.as_bytes())?;

        // 先核对长度前缀，再按声明的宽高分配输出
        let Some((header, block)) = compressed.split_first_chunk::<4>() else {
            return Err(ProtocolError::Decompress(
                "missing uncompressed size header".to_string(),
            ));
        };
        let declared = u32::from_le_bytes(*header) as usize;
        if Some(declared) != expected.checked_mul(2) {
            return Err(ProtocolError::SampleCountMismatch {
                expected,
                actual: declared,
            });
        }
        let bytes = lz4_flex::decompress(block, declared)
            .map_err(|e| ProtocolError::Decompress(e.to_string()))?;

        if bytes.len() != declared {
            return Err(ProtocolError::SampleCountMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        let samples = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        Ok(PixelBuffer {
            width: self.width,
            height: self.height,
            samples,
        })
    }

    /// 压缩比（原始字节数 / 压缩后 base64 文本长度）
    pub fn compression_ratio(&self) -> f64 {
        let raw = self.width as f64 * self.height as f64 * 2.0;
        if self.data.is_empty() || raw == 0.0 {
            return 1.0;
        }
        raw / self.data.len() as f64
    }
}

/// 对角样本互换
///
/// 对每个完整的 2×2 块交换 `(0,0)` 与 `(1,1)`。奇数宽/高时最后一列/行不参与。
/// 仅在 [`DeviceInfo::requires_bayer_swap`](crate::DeviceInfo::requires_bayer_swap)
/// 为真时由图像管线调用。
pub fn swap_bayer_diagonal(buffer: &mut PixelBuffer) {
    let block_cols = buffer.width / 2;
    let block_rows = buffer.height / 2;
    for by in 0..block_rows {
        for bx in 0..block_cols {
            let x = bx * 2;
            let y = by * 2;
            buffer.swap((x, y), (x + 1, y + 1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_wrong_sample_count() {
        assert!(PixelBuffer::new(2, 2, vec![0; 4]).is_ok());
        assert!(matches!(
            PixelBuffer::new(2, 2, vec![0; 3]),
            Err(ProtocolError::SampleCountMismatch { expected: 4, .. })
        ));
    }

    #[test]
    fn test_row_major_layout() {
        let buffer = PixelBuffer::from_fn(3, 2, |x, y| (y * 10 + x) as u16);
        assert_eq!(buffer.samples(), &[0, 1, 2, 10, 11, 12]);
        assert_eq!(buffer.get(2, 1), Some(12));
        assert_eq!(buffer.get(3, 0), None);
    }

    #[test]
    fn test_compress_roundtrip() {
        let buffer = PixelBuffer::from_fn(64, 48, |x, y| (x * 31 + y * 7) as u16 ^ 0xA5A5);
        let compressed = buffer.compress();
        assert_eq!(compressed.encoding, PIXEL_ENCODING);
        assert_eq!(compressed.decompress().unwrap(), buffer);
    }

    #[test]
    fn test_empty_buffer_roundtrip() {
        let buffer = PixelBuffer::zeroed(0, 0);
        let restored = buffer.compress().decompress().unwrap();
        assert_eq!(restored, buffer);
        assert!(restored.is_empty());
    }

    #[test]
    fn test_flat_frame_compresses() {
        let buffer = PixelBuffer::zeroed(256, 256);
        let compressed = buffer.compress();
        assert!(
            compressed.compression_ratio() > 10.0,
            "ratio was {:.2}",
            compressed.compression_ratio()
        );
    }

    #[test]
    fn test_declared_size_mismatch_detected() {
        let mut compressed = PixelBuffer::zeroed(4, 4).compress();
        compressed.height = 5;
        assert!(matches!(
            compressed.decompress(),
            Err(ProtocolError::SampleCountMismatch {
                expected: 20,
                actual: 32
            })
        ));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut compressed = PixelBuffer::zeroed(4, 4).compress();
        compressed.data = "!!not base64!!".to_string();
        assert!(matches!(
            compressed.decompress(),
            Err(ProtocolError::Base64(_))
        ));

        let mut compressed = PixelBuffer::zeroed(4, 4).compress();
        // 声明 32 字节原始数据，块内容被截断
        compressed.data = BASE64.encode([0x20, 0x00, 0x00, 0x00, 0xff]);
        assert!(matches!(
            compressed.decompress(),
            Err(ProtocolError::Decompress(_))
        ));

        let mut compressed = PixelBuffer::zeroed(4, 4).compress();
        compressed.data = BASE64.encode([0x20, 0x00]);
        assert!(matches!(
            compressed.decompress(),
            Err(ProtocolError::Decompress(_))
        ));
    }

    #[test]
    fn test_oversized_length_prefix_rejected_before_decoding() {
        let mut compressed = PixelBuffer::zeroed(4, 4).compress();
        // 8 字节负载声称约 4 GiB 原始数据
        compressed.data = BASE64.encode([0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00]);
        assert!(matches!(
            compressed.decompress(),
            Err(ProtocolError::SampleCountMismatch {
                expected: 16,
                actual: 0xffff_ffff
            })
        ));
    }

    #[test]
    fn test_unknown_encoding_rejected() {
        let mut compressed = PixelBuffer::zeroed(1, 1).compress();
        compressed.encoding = "zstd".to_string();
        assert!(matches!(
            compressed.decompress(),
            Err(ProtocolError::UnsupportedEncoding(_))
        ));
    }

    #[test]
    fn test_bayer_diagonal_swap() {
        // 4x2：两个完整的 2×2 块
        let mut buffer = PixelBuffer::new(4, 2, vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        swap_bayer_diagonal(&mut buffer);
        assert_eq!(buffer.samples(), &[6, 2, 8, 4, 5, 1, 7, 3]);
    }

    #[test]
    fn test_bayer_swap_leaves_odd_edges() {
        let mut buffer = PixelBuffer::from_fn(3, 3, |x, y| (y * 3 + x) as u16);
        swap_bayer_diagonal(&mut buffer);
        // 只有左上角的 2×2 块参与
        assert_eq!(buffer.samples(), &[4, 1, 2, 3, 0, 5, 6, 7, 8]);
    }

    #[test]
    fn test_bayer_swap_is_involution() {
        let original = PixelBuffer::from_fn(6, 4, |x, y| (x * 100 + y) as u16);
        let mut buffer = original.clone();
        swap_bayer_diagonal(&mut buffer);
        assert_ne!(buffer, original);
        swap_bayer_diagonal(&mut buffer);
        assert_eq!(buffer, original);
    }
}
