//! IR optimization passes run between translation and emission.

use super::{Block, LocationDescriptor, Terminal};
use crate::frontend::a32::{self, TranslationOptions};
use tracing::trace;

/// Cap on how far a single interpret run may grow.
const MAX_MERGED_INSTRUCTIONS: u32 = 32;

/// Merge runs of interpreter-only instructions.
///
/// A block whose terminal is `Interpret` covers a single undecodable
/// instruction. When the following instructions would each also translate
/// to interpret-only blocks, hand the whole run to the embedder in one call
/// instead of bouncing through the dispatcher per instruction. The merged
/// instructions join the block's cycle count and guest range.
pub fn merge_interpret_runs(
    block: &mut Block,
    read_code: &mut dyn FnMut(u32) -> u32,
    options: TranslationOptions,
) {
    let (next, num_instructions) = {
        let inner = match block.terminal() {
            Terminal::CheckHalt { else_ } => else_.as_ref(),
            other => other,
        };
        match inner {
            Terminal::Interpret {
                next,
                num_instructions,
            } => (*next, *num_instructions),
            _ => return,
        }
    };
    debug_assert_eq!(num_instructions, 1);
    if next.thumb() {
        return;
    }

    let is_interpret_only = |location: LocationDescriptor, read_code: &mut dyn FnMut(u32) -> u32| {
        let probe = a32::translate(location, read_code, options);
        probe.is_empty()
            && matches!(
                probe.terminal(),
                Terminal::CheckHalt { else_ }
                    if matches!(**else_, Terminal::Interpret { next, .. } if next == location)
            )
    };

    let mut merged = 1u32;
    while merged < MAX_MERGED_INSTRUCTIONS
        && is_interpret_only(next.advance_pc((merged * 4) as i32), read_code)
    {
        merged += 1;
    }

    if merged > 1 {
        trace!("merged {merged} interpret-only instructions at {:#x}", next.pc());
        block.add_cycles(merged as u64 - 1);
        block.set_end_location(next.advance_pc((merged * 4) as i32));
        block.set_terminal(Terminal::CheckHalt {
            else_: Box::new(Terminal::Interpret {
                next,
                num_instructions: merged,
            }),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(pc: u32) -> LocationDescriptor {
        LocationDescriptor::new(pc, false, 0)
    }

    #[test]
    fn merges_consecutive_undecodable_instructions() {
        // Three MCRs then a b .
        let words = [0xEE01_0F10u32, 0xEE01_0F10, 0xEE01_0F10, 0xEAFF_FFFE];
        let mut read = |pc: u32| words[(pc / 4) as usize % words.len()];

        let mut block = a32::translate(loc(0), &mut read, TranslationOptions::default());
        merge_interpret_runs(&mut block, &mut read, TranslationOptions::default());

        match block.terminal() {
            Terminal::CheckHalt { else_ } => match **else_ {
                Terminal::Interpret {
                    next,
                    num_instructions,
                } => {
                    assert_eq!(next, loc(0));
                    assert_eq!(num_instructions, 3);
                }
                ref other => panic!("unexpected terminal {other:?}"),
            },
            other => panic!("unexpected terminal {other:?}"),
        }
        assert_eq!(block.cycle_count(), 3);
        assert_eq!(block.end_location(), loc(12));
    }

    #[test]
    fn leaves_translatable_blocks_alone() {
        let words = [0xE3A0_0001u32, 0xEAFF_FFFE]; // mov r0, #1; b .
        let mut read = |pc: u32| words[(pc / 4) as usize % words.len()];

        let mut block = a32::translate(loc(0), &mut read, TranslationOptions::default());
        let cycles = block.cycle_count();
        merge_interpret_runs(&mut block, &mut read, TranslationOptions::default());
        assert_eq!(block.cycle_count(), cycles);
    }
}
