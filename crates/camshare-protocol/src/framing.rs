//! 帧切分
//!
//! 每个请求/响应都是一段 UTF-8 JSON 文本，后接固定的终止序列 [`FRAME_TERMINATOR`]。
//! 一次传输读取可能包含多个拼接在一起的帧，也可能只包含半个帧。
//!
//! 紧凑 JSON 不会出现裸 `\r`（字符串中的控制字符都会被转义），所以终止序列不会与帧内容冲突。

use crate::error::ProtocolError;
use bytes::{Buf, BytesMut};
use serde::Serialize;

/// 帧终止序列
pub const FRAME_TERMINATOR: &[u8] = b"\r\n.\r\n";

/// 默认的未终止帧上限（64 MiB，足够容纳全幅压缩像素）
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// 把消息编码为带终止序列的帧
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(message)?;
    buf.extend_from_slice(FRAME_TERMINATOR);
    Ok(buf)
}

/// 增量帧解码器
///
/// 调用 [`push`](Self::push) 追加读到的字节，然后循环调用 [`next_frame`](Self::next_frame)
/// 直到返回 `None`。
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_bytes: usize,
    /// 下次搜索终止序列的起点（避免重复扫描已确认不含终止序列的前缀）
    scan_from: usize,
    /// 超长帧的剩余部分正在被丢弃
    discarding: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_limit(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_frame_bytes,
            scan_from: 0,
            discarding: false,
        }
    }

    /// 追加读到的字节
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// 当前缓冲的字节数
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// 取出下一个完整帧
    ///
    /// # 返回
    /// - `Some(Ok(text))`: 一个完整帧（不含终止序列）
    /// - `Some(Err(_))`: 帧内容非法（非 UTF-8）或超过上限；解码器已丢弃该帧，可以继续调用
    /// - `None`: 需要更多数据
    pub fn next_frame(&mut self) -> Option<Result<String, ProtocolError>> {
        loop {
            let Some(pos) = find_terminator(&self.buf[self.scan_from..]) else {
                return self.handle_incomplete();
            };

            let end = self.scan_from + pos;
            let frame = self.buf.split_to(end);
            self.buf.advance(FRAME_TERMINATOR.len());
            self.scan_from = 0;

            if self.discarding {
                // 超长帧的尾部，连同终止序列一起丢弃
                self.discarding = false;
                continue;
            }

            if frame.len() > self.max_frame_bytes {
                return Some(Err(ProtocolError::FrameTooLarge {
                    limit: self.max_frame_bytes,
                }));
            }

            match String::from_utf8(frame.to_vec()) {
                Ok(text) if text.trim().is_empty() => continue,
                Ok(text) => return Some(Ok(text)),
                Err(_) => return Some(Err(ProtocolError::InvalidUtf8)),
            }
        }
    }

    fn handle_incomplete(&mut self) -> Option<Result<String, ProtocolError>> {
        if self.buf.len() > self.max_frame_bytes {
            // 保留可能是终止序列前缀的尾部字节
            let keep = FRAME_TERMINATOR.len() - 1;
            let drop_len = self.buf.len() - keep;
            self.buf.advance(drop_len);
            self.scan_from = 0;
            if !self.discarding {
                self.discarding = true;
                return Some(Err(ProtocolError::FrameTooLarge {
                    limit: self.max_frame_bytes,
                }));
            }
            return None;
        }

        self.scan_from = self
            .buf
            .len()
            .saturating_sub(FRAME_TERMINATOR.len() - 1);
        None
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(FRAME_TERMINATOR.len())
        .position(|window| window == FRAME_TERMINATOR)
}
