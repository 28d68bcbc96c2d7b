use bytes::Bytes;

/// One decoded raw frame as produced by the decoder child process
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub channels: usize,
}

impl RawFrame {
    /// Wrap a decoded pixel buffer, checking it matches the declared shape
    pub fn from_buffer(data: Vec<u8>, width: u32, height: u32, channels: usize) -> Option<Self> {
        if data.len() != width as usize * height as usize * channels {
            return None;
        }
        Some(RawFrame {
            data: Bytes::from(data),
            width,
            height,
            channels,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Per-frame metadata travelling alongside the pixels through the queue
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub frame_id: u64,
    pub timestamp_received: f64,
    pub camera_type: String,
    pub stream_id: u32,
    pub original_fps: u32,
    pub target_fps: u32,
    pub input_width: u32,
    pub input_height: u32,
    pub output_width: u32,
    pub output_height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_buffer_rejects_shape_mismatch() {
        assert!(RawFrame::from_buffer(vec![0u8; 12], 2, 2, 3).is_some());
        assert!(RawFrame::from_buffer(vec![0u8; 11], 2, 2, 3).is_none());
    }
}
