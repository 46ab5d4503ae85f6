//! 上下文保存/恢复属性测试
//!
//! 对任意可达的 CpuContext，restore(save(c)) == c。

use dbt_core::save_area::{gpr_offset, offsets, vector_offset};
use dbt_core::{CpuContext, ExclusiveMonitor, SAVE_AREA_SIZE, SaveArea, Vector128, restore, save};
use proptest::prelude::*;

fn any_context() -> impl Strategy<Value = CpuContext> {
    (
        prop::array::uniform30(any::<u64>()),
        any::<[u64; 4]>(),
        prop::collection::vec((any::<u64>(), any::<u64>()), 32),
        any::<(u32, u32)>(),
        any::<(u64, u64, u32)>(),
    )
        .prop_map(|(x, [lr, sp, pc, nzcv], vecs, (fpcr, fpsr), (addr, value, size))| {
            let mut ctx = CpuContext::new();
            ctx.gpr.x = x;
            ctx.gpr.lr = lr;
            ctx.gpr.sp = sp;
            ctx.gpr.pc = pc;
            ctx.gpr.nzcv = nzcv;
            for (i, (lo, hi)) in vecs.into_iter().enumerate() {
                ctx.vec.v[i] = Vector128::new(lo, hi);
            }
            ctx.fp.fpcr = fpcr;
            ctx.fp.fpsr = fpsr;
            ctx.monitor = ExclusiveMonitor { addr, value, size };
            ctx
        })
}

proptest! {
    #[test]
    fn prop_round_trip(ctx in any_context()) {
        let mut area = SaveArea::new();
        save(&ctx, &mut area);
        let mut restored = CpuContext::new();
        restore(&area, &mut restored).unwrap();
        prop_assert_eq!(restored, ctx);
    }

    #[test]
    fn prop_bytes_round_trip(ctx in any_context()) {
        let area = ctx.to_save_area();
        let copy = SaveArea::from_bytes(area.as_bytes()).unwrap();
        prop_assert_eq!(CpuContext::from_save_area(&copy).unwrap(), ctx);
    }

    #[test]
    fn prop_registers_land_at_fixed_offsets(ctx in any_context(), r in 0u8..30, v in 0u8..32) {
        let area = ctx.to_save_area();
        let bytes = area.as_bytes();
        let at = gpr_offset(r);
        prop_assert_eq!(&bytes[at..at + 8], &ctx.gpr.x[r as usize].to_le_bytes()[..]);
        let at = vector_offset(v);
        prop_assert_eq!(&bytes[at..at + 8], &ctx.vec.v[v as usize].lo.to_le_bytes()[..]);
        prop_assert_eq!(&bytes[at + 8..at + 16], &ctx.vec.v[v as usize].hi.to_le_bytes()[..]);
        prop_assert_eq!(&bytes[offsets::SP..offsets::SP + 8], &ctx.gpr.sp.to_le_bytes()[..]);
    }
}

#[test]
fn test_size_is_fixed() {
    assert_eq!(std::mem::size_of::<SaveArea>(), SAVE_AREA_SIZE);
    assert_eq!(std::mem::align_of::<SaveArea>(), 16);
}
