//! Property-based tests for address-space reconciliation: whatever the live
//! layout, reconciling against a saved area list must reproduce exactly that
//! list.

use proptest::prelude::*;
use ss_core::page::PAGE_SIZE;
use ss_core::reconcile::{reconcile, AreaList, ReconcileStats};
use ss_core::space::SimulatedAddressSpace;
use ss_core::{AddressSpace, Area, Protection, SkipPolicy};

const ORIGIN: usize = 0x100000;

fn protection_strategy() -> impl Strategy<Value = Protection> {
    prop_oneof![
        Just(Protection::empty()),
        Just(Protection::READ),
        Just(Protection::READ | Protection::WRITE),
        Just(Protection::READ | Protection::EXEC),
    ]
}

/// Anonymous areas with at least one unmapped page between neighbours, so
/// the simulated kernel never merges them.
fn layout_strategy() -> impl Strategy<Value = Vec<Area>> {
    prop::collection::vec((0usize..3, 1usize..5, protection_strategy()), 0..7).prop_map(|cells| {
        let mut at = ORIGIN;
        cells
            .into_iter()
            .map(|(gap, pages, prot)| {
                let start = at + (gap + 1) * PAGE_SIZE;
                let end = start + pages * PAGE_SIZE;
                at = end;
                Area::anonymous(start, end, prot)
            })
            .collect()
    })
}

fn live_space(layout: &[Area]) -> SimulatedAddressSpace {
    let mut space = SimulatedAddressSpace::new();
    for area in layout {
        space.map_anonymous(area.start, area.size(), area.prot);
    }
    space
}

fn run(space: &mut SimulatedAddressSpace, saved: &[Area]) -> ReconcileStats {
    let mut buf = vec![0u8; 1 << 16];
    let len = space.read_maps(&mut buf).unwrap();
    reconcile(space, &mut AreaList::new(saved), &buf[..len], SkipPolicy::default()).unwrap()
}

fn shape(areas: &[Area]) -> Vec<(usize, usize, Protection)> {
    areas.iter().map(|a| (a.start, a.end, a.prot)).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Any live layout converges onto the saved one.
    #[test]
    fn reconcile_converges_on_saved_layout(
        live in layout_strategy(),
        saved in layout_strategy(),
    ) {
        let mut space = live_space(&live);
        run(&mut space, &saved);
        prop_assert_eq!(shape(&space.areas()), shape(&saved));
    }

    /// A live layout that already matches is left alone.
    #[test]
    fn matching_layout_needs_no_changes(layout in layout_strategy()) {
        let mut space = live_space(&layout);
        space.clear_ops();
        let stats = run(&mut space, &layout);
        prop_assert_eq!(stats, ReconcileStats::default());
        prop_assert!(space.ops().is_empty());
    }

    /// Running reconciliation twice changes nothing the second time.
    #[test]
    fn reconcile_is_idempotent(
        live in layout_strategy(),
        saved in layout_strategy(),
    ) {
        let mut space = live_space(&live);
        run(&mut space, &saved);
        space.clear_ops();
        let again = run(&mut space, &saved);
        prop_assert_eq!(again, ReconcileStats::default());
        prop_assert!(space.ops().is_empty());
    }
}
