//! Fuzz test for the blocker stage
//!
//! Feeds arbitrary chunk sequences through a blocker and checks that the
//! emitted blocks reconstruct the input followed by zero padding.

#![no_main]

use arbitrary::Arbitrary;
use flashkit_core::{Block, Blocker, Stage};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    block_size: u16,
    chunks: Vec<Vec<u8>>,
}

fuzz_target!(|input: Input| {
    let block_size = usize::from(input.block_size % 8192) + 1;
    let Ok(mut blocker) = Blocker::new(block_size) else {
        return;
    };

    let mut out = Vec::new();
    let mut expected = Vec::new();
    for chunk in input.chunks {
        expected.extend_from_slice(&chunk);
        blocker.consume(Block::raw(chunk), &mut out).unwrap();
        assert!(blocker.buffered() < block_size);
    }
    blocker.flush(&mut out).unwrap();
    assert_eq!(blocker.buffered(), 0);

    let mut actual = Vec::new();
    for block in &out {
        assert_eq!(block.len(), block_size);
        assert!(!block.is_addressed());
        actual.extend_from_slice(&block.data);
    }

    assert_eq!(actual.len(), expected.len().div_ceil(block_size) * block_size);
    assert_eq!(&actual[..expected.len()], &expected[..]);
    assert!(actual[expected.len()..].iter().all(|&b| b == 0));
});
