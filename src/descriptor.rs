//! Descriptor chains as handed to a DMA engine backend.

use crate::Error;

/// One hardware descriptor worth of transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub dma_addr: u64,
    pub len: usize,
    /// First segment of a frame.
    pub sof: bool,
    /// Last segment of a frame.
    pub eof: bool,
}

/// Ordered list of segments. Segments execute in order; a cyclic chain
/// links its last segment back to the first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorChain {
    segments: Vec<Segment>,
    cyclic: bool,
}

impl DescriptorChain {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_cyclic(&self) -> bool {
        self.cyclic
    }

    pub fn frames(&self) -> usize {
        self.segments.iter().filter(|s| s.eof).count()
    }

    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// Index of the segment executed after `index`, if any.
    pub fn next(&self, index: usize) -> Option<usize> {
        if index + 1 < self.segments.len() {
            Some(index + 1)
        } else if self.cyclic && !self.segments.is_empty() {
            Some(0)
        } else {
            None
        }
    }
}

/// Builds a [`DescriptorChain`] honoring the hardware segment length limit
/// and ring depth.
#[derive(Debug)]
pub struct ChainBuilder {
    max_segment_len: usize,
    max_descriptors: usize,
    frames: Vec<(u64, usize)>,
}

impl ChainBuilder {
    pub fn new(max_segment_len: usize, max_descriptors: usize) -> ChainBuilder {
        ChainBuilder {
            max_segment_len,
            max_descriptors,
            frames: Vec::new(),
        }
    }

    /// Appends a frame starting at device address `dma_addr`.
    pub fn frame(mut self, dma_addr: u64, len: usize) -> ChainBuilder {
        self.frames.push((dma_addr, len));
        self
    }

    pub fn build(self, cyclic: bool) -> Result<DescriptorChain, Error> {
        if self.max_segment_len == 0 {
            return Err(Error::DescriptorBuildFailed("zero segment length limit".into()));
        }
        if self.frames.is_empty() {
            return Err(Error::DescriptorBuildFailed("no frames".into()));
        }

        let mut count = 0usize;
        for &(_, len) in &self.frames {
            if len == 0 {
                return Err(Error::DescriptorBuildFailed("empty frame".into()));
            }
            count = count.saturating_add(len.div_ceil(self.max_segment_len));
        }
        if count > self.max_descriptors {
            return Err(Error::DescriptorBuildFailed(format!(
                "{} descriptors needed, ring holds {}",
                count, self.max_descriptors
            )));
        }

        let mut segments = Vec::new();
        segments
            .try_reserve_exact(count)
            .map_err(|_| Error::DescriptorBuildFailed("out of descriptor memory".into()))?;

        for (addr, len) in self.frames {
            let mut done = 0;
            while done < len {
                let chunk = usize::min(self.max_segment_len, len - done);
                segments.push(Segment {
                    dma_addr: addr + done as u64,
                    len: chunk,
                    sof: done == 0,
                    eof: done + chunk == len,
                });
                done += chunk;
            }
        }

        Ok(DescriptorChain { segments, cyclic })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_at_segment_limit() {
        let chain = ChainBuilder::new(1000, 16)
            .frame(0x1000, 2500)
            .build(false)
            .unwrap();
        let lens: Vec<_> = chain.segments().iter().map(|s| s.len).collect();
        assert_eq!(lens, vec![1000, 1000, 500]);
        assert_eq!(chain.segments()[1].dma_addr, 0x1000 + 1000);
        assert!(chain.segments()[0].sof && !chain.segments()[0].eof);
        assert!(chain.segments()[2].eof);
        assert_eq!(chain.total_len(), 2500);
        assert_eq!(chain.frames(), 1);
        assert_eq!(chain.next(2), None);
    }

    #[test]
    fn cyclic_chain_wraps() {
        let chain = ChainBuilder::new(4096, 16)
            .frame(0x10000, 4096)
            .frame(0x20000, 4096)
            .build(true)
            .unwrap();
        assert_eq!(chain.frames(), 2);
        assert_eq!(chain.next(0), Some(1));
        assert_eq!(chain.next(1), Some(0));
    }

    #[test]
    fn ring_depth_is_enforced() {
        let err = ChainBuilder::new(16, 4).frame(0, 65).build(false);
        assert!(matches!(err, Err(Error::DescriptorBuildFailed(_))));
        assert!(ChainBuilder::new(16, 4).frame(0, 64).build(false).is_ok());
        let err = ChainBuilder::new(0x3ff_ffff, 256)
            .frame(0, usize::MAX)
            .frame(0, usize::MAX)
            .build(false);
        assert!(matches!(err, Err(Error::DescriptorBuildFailed(_))));
    }

    #[test]
    fn empty_frames_are_rejected() {
        assert!(ChainBuilder::new(16, 4).frame(0, 0).build(false).is_err());
        assert!(ChainBuilder::new(16, 4).build(false).is_err());
    }
}
