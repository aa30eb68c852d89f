//! Pipeline stages and the linear pipeline that chains them

use crate::block::Block;
use crate::error::Result;

/// One step of a flash pipeline
///
/// A stage consumes blocks in arrival order and pushes zero or more blocks
/// into `out` for the next stage. `flush` is called once at end of stream
/// and may emit trailing blocks.
pub trait Stage: Send {
    /// Short name used in logs, errors and the run's stage list
    fn name(&self) -> &'static str;

    /// Process one block
    fn consume(&mut self, block: Block, out: &mut Vec<Block>) -> Result<()>;

    /// Emit output held back by the last `consume`
    ///
    /// Stages whose output can be far larger than their input (decompression)
    /// emit one bounded block per call and keep the rest of their input. The
    /// pipeline keeps calling this until it returns `false`.
    fn resume(&mut self, _out: &mut Vec<Block>) -> Result<bool> {
        Ok(false)
    }

    /// End of stream
    fn flush(&mut self, _out: &mut Vec<Block>) -> Result<()> {
        Ok(())
    }
}

impl<S: Stage + ?Sized> Stage for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn consume(&mut self, block: Block, out: &mut Vec<Block>) -> Result<()> {
        (**self).consume(block, out)
    }

    fn resume(&mut self, out: &mut Vec<Block>) -> Result<bool> {
        (**self).resume(out)
    }

    fn flush(&mut self, out: &mut Vec<Block>) -> Result<()> {
        (**self).flush(out)
    }
}

/// An ordered chain of stages
///
/// Blocks pushed in are run through every stage in order; whatever leaves
/// the last stage is handed to the sink.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// Create an empty pipeline
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage at the end
    pub fn append(&mut self, stage: Box<dyn Stage>) {
        self.stages.push(stage);
    }

    /// Add a stage at the front
    pub fn prepend(&mut self, stage: Box<dyn Stage>) {
        self.stages.insert(0, stage);
    }

    /// Stage names in order
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the pipeline has no stages
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run one block through every stage and into `sink`
    ///
    /// Blocks travel depth-first: everything a stage emits reaches the sink
    /// before that stage is asked for more, so at most one stage's output
    /// per level is in flight.
    pub fn push<F>(&mut self, block: Block, sink: &mut F) -> Result<()>
    where
        F: FnMut(Block) -> Result<()>,
    {
        feed(&mut self.stages, block, sink)
    }

    /// Flush every stage in order, feeding each stage's trailing output
    /// through the stages after it
    pub fn finish<F>(&mut self, sink: &mut F) -> Result<()>
    where
        F: FnMut(Block) -> Result<()>,
    {
        for i in 0..self.stages.len() {
            let (head, rest) = self.stages[i..].split_at_mut(1);
            let stage = &mut head[0];

            let mut out = Vec::new();
            stage.flush(&mut out)?;
            forward(&mut **stage, out, rest, sink)?;
        }
        Ok(())
    }
}

fn feed<F>(stages: &mut [Box<dyn Stage>], block: Block, sink: &mut F) -> Result<()>
where
    F: FnMut(Block) -> Result<()>,
{
    let Some((stage, rest)) = stages.split_first_mut() else {
        return sink(block);
    };

    let mut out = Vec::new();
    stage.consume(block, &mut out)?;
    forward(&mut **stage, out, rest, sink)
}

/// Hand `out` downstream, then drain whatever `stage` still holds
fn forward<F>(
    stage: &mut dyn Stage,
    mut out: Vec<Block>,
    rest: &mut [Box<dyn Stage>],
    sink: &mut F,
) -> Result<()>
where
    F: FnMut(Block) -> Result<()>,
{
    loop {
        for block in out.drain(..) {
            feed(rest, block, sink)?;
        }
        if !stage.resume(&mut out)? {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct Double;

    impl Stage for Double {
        fn name(&self) -> &'static str {
            "double"
        }

        fn consume(&mut self, block: Block, out: &mut Vec<Block>) -> Result<()> {
            out.push(block.clone());
            out.push(block);
            Ok(())
        }
    }

    /// Holds everything back until flush
    struct Hold(Vec<Block>);

    impl Stage for Hold {
        fn name(&self) -> &'static str {
            "hold"
        }

        fn consume(&mut self, block: Block, _out: &mut Vec<Block>) -> Result<()> {
            self.0.push(block);
            Ok(())
        }

        fn flush(&mut self, out: &mut Vec<Block>) -> Result<()> {
            out.append(&mut self.0);
            Ok(())
        }
    }

    /// Emits one byte per call, holding the rest back
    struct Trickle(Vec<u8>);

    impl Stage for Trickle {
        fn name(&self) -> &'static str {
            "trickle"
        }

        fn consume(&mut self, block: Block, out: &mut Vec<Block>) -> Result<()> {
            self.0.extend(block.data.iter().rev());
            self.resume(out).map(|_| ())
        }

        fn resume(&mut self, out: &mut Vec<Block>) -> Result<bool> {
            match self.0.pop() {
                Some(byte) => {
                    out.push(Block::raw(vec![byte]));
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    /// Records every byte that passes through
    struct Count(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl Stage for Count {
        fn name(&self) -> &'static str {
            "count"
        }

        fn consume(&mut self, block: Block, out: &mut Vec<Block>) -> Result<()> {
            self.0.lock().unwrap().extend_from_slice(&block.data);
            out.push(block);
            Ok(())
        }
    }

    struct Fail;

    impl Stage for Fail {
        fn name(&self) -> &'static str {
            "fail"
        }

        fn consume(&mut self, _block: Block, _out: &mut Vec<Block>) -> Result<()> {
            Err(Error::upstream("fail", "boom"))
        }
    }

    #[test]
    fn test_empty_pipeline_passes_through() {
        let mut pipeline = Pipeline::new();
        let mut seen = Vec::new();
        pipeline
            .push(Block::raw(vec![1]), &mut |b| {
                seen.push(b);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![Block::raw(vec![1])]);
        assert!(pipeline.is_empty());
    }

    #[test]
    fn test_append_and_prepend_order() {
        let mut pipeline = Pipeline::new();
        pipeline.append(Box::new(Double));
        pipeline.prepend(Box::new(Hold(Vec::new())));
        assert_eq!(pipeline.names(), vec!["hold", "double"]);
        assert_eq!(pipeline.len(), 2);
    }

    #[test]
    fn test_flush_cascades_downstream() {
        let mut pipeline = Pipeline::new();
        pipeline.append(Box::new(Hold(Vec::new())));
        pipeline.append(Box::new(Double));

        let mut seen = Vec::new();
        let mut sink = |b: Block| {
            seen.push(b);
            Ok(())
        };
        pipeline.push(Block::raw(vec![7]), &mut sink).unwrap();
        pipeline.finish(&mut sink).unwrap();

        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|b| b.data == vec![7]));
    }

    #[test]
    fn test_stage_error_stops_sink() {
        let mut pipeline = Pipeline::new();
        pipeline.append(Box::new(Fail));

        let mut called = false;
        let result = pipeline.push(Block::raw(vec![1]), &mut |_| {
            called = true;
            Ok(())
        });
        assert!(matches!(result, Err(Error::Upstream { stage: "fail", .. })));
        assert!(!called);
    }

    #[test]
    fn test_resumed_output_reaches_sink_in_order() {
        let seen_by_count = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline.append(Box::new(Trickle(Vec::new())));
        pipeline.append(Box::new(Count(std::sync::Arc::clone(&seen_by_count))));

        let mut sunk = Vec::new();
        let mut sink = |b: Block| {
            // Depth-first: the downstream stage has seen exactly what was sunk
            assert_eq!(seen_by_count.lock().unwrap().len(), sunk.len() + 1);
            sunk.extend_from_slice(&b.data);
            Ok(())
        };
        pipeline.push(Block::raw(vec![1, 2, 3]), &mut sink).unwrap();
        pipeline.push(Block::raw(vec![4]), &mut sink).unwrap();
        pipeline.finish(&mut sink).unwrap();

        assert_eq!(sunk, vec![1, 2, 3, 4]);
    }
}
