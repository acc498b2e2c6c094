//! Property-based invariant tests for the label engine.
//!
//! 1. The identity index always matches a pixel scan, whatever actions ran
//! 2. Swapping two labels everywhere twice is the identity
//! 3. apply + undo + redo lands on the same state as apply alone
//! 4. Identity prediction is deterministic and only reuses or mints ids
//! 5. Neither lineage nor pixel edits on a tracking file create a cycle or
//!    break the parent/daughter rules

use cellmask::engine::{Action, Engine, LabelEngine};
use cellmask::lineage::LineageGraph;
use cellmask::matcher::IdentityMatcher;
use cellmask::volume::{labels_in_plane, LabelVolume};
use cellmask_protocol::Label;
use ndarray::{Array2, Array4, Axis};
use proptest::prelude::*;
use std::collections::BTreeSet;

// ── Strategies ──────────────────────────────────────────────────────────

const FRAMES: usize = 3;
const SIDE: usize = 5;

fn labels_strategy(features: usize) -> impl Strategy<Value = Array4<Label>> {
    proptest::collection::vec(0u32..5, FRAMES * SIDE * SIDE * features).prop_map(move |values| {
        Array4::from_shape_vec((FRAMES, SIDE, SIDE, features), values)
            .unwrap_or_else(|_| Array4::zeros((FRAMES, SIDE, SIDE, features)))
    })
}

fn raw_strategy() -> impl Strategy<Value = Array4<f32>> {
    proptest::collection::vec(0.0f32..1.0, FRAMES * SIDE * SIDE).prop_map(|values| {
        Array4::from_shape_vec((FRAMES, SIDE, SIDE, 1), values)
            .unwrap_or_else(|_| Array4::zeros((FRAMES, SIDE, SIDE, 1)))
    })
}

fn label() -> impl Strategy<Value = Label> {
    1u32..6
}

fn frame() -> impl Strategy<Value = usize> {
    0..FRAMES
}

fn coord() -> impl Strategy<Value = usize> {
    0..SIDE + 1
}

/// Plane edits valid on either file kind.
fn pixel_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        (label(), frame()).prop_map(|(label, frame)| Action::NewSingleCell { label, frame }),
        (label(), frame()).prop_map(|(label, frame)| Action::DeleteMask { label, frame }),
        (label(), label(), frame()).prop_map(|(label_1, label_2, frame)| {
            Action::SwapSingleFrame { label_1, label_2, frame }
        }),
        (label(), label()).prop_map(|(label_1, label_2)| Action::SwapAllFrame { label_1, label_2 }),
        (
            proptest::collection::vec((0usize..SIDE, 0usize..SIDE), 1..4),
            0u32..6,
            label(),
            1usize..3,
            any::<bool>(),
            frame()
        )
            .prop_map(|(trace, target_value, brush_value, brush_size, erase, frame)| {
                Action::HandleDraw { trace, target_value, brush_value, brush_size, erase, frame }
            }),
        (label(), frame(), coord(), coord()).prop_map(|(label, frame, x_location, y_location)| {
            Action::TrimPixels { label, frame, x_location, y_location }
        }),
        (label(), frame(), coord(), coord()).prop_map(|(label, frame, x_location, y_location)| {
            Action::FillHole { label, frame, x_location, y_location }
        }),
        (label(), frame(), coord(), coord()).prop_map(|(label, frame, x_location, y_location)| {
            Action::FloodContiguous { label, frame, x_location, y_location }
        }),
        (label(), frame(), coord(), coord(), coord(), coord()).prop_map(
            |(label, frame, x1_location, y1_location, x2_location, y2_location)| Action::Watershed {
                label,
                frame,
                x1_location,
                y1_location,
                x2_location,
                y2_location,
            }
        ),
        (coord(), coord(), coord(), coord(), frame(), label())
            .prop_map(|(y1, x1, y2, x2, frame, label)| Action::Threshold { y1, x1, y2, x2, frame, label }),
    ]
}

fn zstack_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        1 => (0usize..2).prop_map(|feature| Action::ChangeFeature { feature }),
        1 => (label(), frame()).prop_map(|(label, frame)| Action::NewCellStack { label, frame }),
        1 => (label(), label(), frame()).prop_map(|(label_1, label_2, frame)| {
            Action::ReplaceSingle { label_1, label_2, frame }
        }),
        1 => (label(), label()).prop_map(|(label_1, label_2)| Action::Replace { label_1, label_2 }),
        1 => frame().prop_map(|frame| Action::PredictSingle { frame }),
        1 => Just(Action::PredictZstack {}),
        6 => pixel_action(),
    ]
}

fn track_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        1 => (label(), frame()).prop_map(|(label, frame)| Action::NewTrack { label, frame }),
        2 => (label(), label()).prop_map(|(label_1, label_2)| Action::SetParent { label_1, label_2 }),
        1 => (label(), label()).prop_map(|(label_1, label_2)| Action::SwapTracks { label_1, label_2 }),
        1 => (label(), label()).prop_map(|(label_1, label_2)| Action::Replace { label_1, label_2 }),
        4 => pixel_action(),
    ]
}

fn zstack_engine(labels: Array4<Label>) -> LabelEngine {
    let raw = Array4::<f32>::zeros((FRAMES, SIDE, SIDE, 1));
    LabelEngine::new(LabelVolume::zstack(raw, labels).unwrap())
}

/// Labels found by scanning the pixels of one feature.
fn scanned_ids(volume: &LabelVolume, feature: usize) -> BTreeSet<Label> {
    (0..volume.num_frames())
        .flat_map(|f| labels_in_plane(volume.get_label_plane(f, feature)))
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
// 1. Index consistency
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn index_matches_pixels_after_any_actions(
        labels in labels_strategy(2),
        raw in raw_strategy(),
        actions in proptest::collection::vec(zstack_action(), 1..12),
    ) {
        let mut engine = LabelEngine::new(LabelVolume::zstack(raw, labels).unwrap());
        for action in actions {
            let _ = engine.apply(action);
            let problems = engine.check_consistency();
            prop_assert!(problems.is_empty(), "{:?}", problems);
            for feature in 0..2 {
                prop_assert_eq!(engine.volume().cell_ids(feature), scanned_ids(engine.volume(), feature));
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 2. Swap involution
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn swap_all_frame_twice_restores_volume(
        labels in labels_strategy(1),
        a in label(),
        b in label(),
    ) {
        prop_assume!(a != b);
        let mut engine = zstack_engine(labels);
        let before = engine.volume().clone();
        for _ in 0..2 {
            engine.apply(Action::SwapAllFrame { label_1: a, label_2: b }).unwrap();
        }
        prop_assert_eq!(engine.volume(), &before);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 3. Undo/redo round trip
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn undo_then_redo_matches_apply(
        labels in labels_strategy(1),
        prefix in proptest::collection::vec(zstack_action(), 0..4),
        action in zstack_action(),
    ) {
        let mut engine = zstack_engine(labels);
        for earlier in prefix {
            let _ = engine.apply(earlier);
        }
        prop_assume!(engine.apply(action).is_ok());
        let volume = engine.volume().clone();
        let selection = engine.selection();

        engine.undo().unwrap();
        engine.redo().unwrap();
        prop_assert_eq!(engine.volume(), &volume);
        prop_assert_eq!(engine.selection(), selection);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 4. Prediction determinism and label conservation
// ═══════════════════════════════════════════════════════════════════════

fn plane_strategy() -> impl Strategy<Value = Array2<Label>> {
    proptest::collection::vec(0u32..7, SIDE * SIDE).prop_map(|values| {
        Array2::from_shape_vec((SIDE, SIDE), values).unwrap_or_else(|_| Array2::zeros((SIDE, SIDE)))
    })
}

proptest! {
    #[test]
    fn predict_next_is_deterministic_and_conservative(
        prev in plane_strategy(),
        next in plane_strategy(),
        threshold in 0.0f64..0.9,
    ) {
        let matcher = IdentityMatcher::new(threshold);
        let out = matcher.predict_next(prev.view(), next.view()).unwrap();
        prop_assert_eq!(&out, &matcher.predict_next(prev.view(), next.view()).unwrap());

        let prev_ids = labels_in_plane(prev.view());
        let max_prev = prev_ids.iter().next_back().copied().unwrap_or(0);
        for &v in out.iter() {
            prop_assert!(v == 0 || prev_ids.contains(&v) || v > max_prev);
        }
        // background stays background and objects stay distinct
        prop_assert!(out.iter().zip(next.iter()).all(|(&o, &n)| (o == 0) == (n == 0)));
        prop_assert_eq!(labels_in_plane(out.view()).len(), labels_in_plane(next.view()).len());
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 5. Lineage acyclicity
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn lineage_edits_keep_graph_acyclic(
        labels in labels_strategy(1),
        actions in proptest::collection::vec(track_action(), 1..16),
    ) {
        let raw = Array4::<f32>::zeros((FRAMES, SIDE, SIDE, 1));
        let volume = LabelVolume::track(raw, labels, LineageGraph::new()).unwrap();
        let mut engine = LabelEngine::new(volume);
        for action in actions {
            let _ = engine.apply(action);
            let graph = engine.volume().lineage().unwrap();
            prop_assert!(!graph.has_cycle());
            let problems = engine.check_consistency();
            prop_assert!(problems.is_empty(), "{:?}", problems);
        }
        let stack = engine.volume().feature_stack(0);
        prop_assert_eq!(stack.len_of(Axis(0)), FRAMES);
    }
}
