use crate::lineage::LineageGraph;
use cellmask_protocol::Label;
use std::collections::{BTreeSet, HashMap};
use svg::Document;
use svg::node::element::{Line, Rectangle, Text};

const FRAME_W: f32 = 24.0;
const ROW_H: f32 = 28.0;
const LEFT: f32 = 80.0;
const TOP: f32 = 60.0;
const FONT: &str = "Helvetica, Arial, sans-serif";

/// Rows in depth-first order: roots by first frame (then label), each
/// followed by its daughters.
fn row_order(graph: &LineageGraph) -> Vec<Label> {
    let mut order = Vec::with_capacity(graph.len());
    let mut seen: BTreeSet<Label> = BTreeSet::new();
    let mut roots: Vec<(Option<usize>, Label)> = graph
        .tracks()
        .values()
        .filter(|t| t.parent.is_none_or(|p| graph.track(p).is_none()))
        .map(|t| (t.first_frame(), t.label))
        .collect();
    roots.sort_unstable();
    // tracks reachable from no root (only possible in a corrupt table) go last
    let rest = graph.tracks().keys().copied();
    for start in roots.into_iter().map(|(_, label)| label).chain(rest) {
        let mut stack = vec![start];
        while let Some(label) = stack.pop() {
            if !seen.insert(label) {
                continue;
            }
            order.push(label);
            if let Some(track) = graph.track(label) {
                stack.extend(track.daughters.iter().rev().copied());
            }
        }
    }
    order
}

/// Draw the lineage as one bar per track along the frame axis, with
/// division edges from each parent's last frame to its daughters.
pub fn render_lineage_svg(graph: &LineageGraph) -> String {
    let rows = row_order(graph);
    let frames = graph
        .tracks()
        .values()
        .filter_map(|t| t.last_frame())
        .max()
        .map_or(1, |f| f + 1);
    let width = LEFT + frames as f32 * FRAME_W + 40.0;
    let height = TOP + rows.len().max(1) as f32 * ROW_H + 20.0;

    let mut doc = Document::new()
        .set("viewBox", (0, 0, width, height))
        .set("width", width)
        .set("height", height)
        .set("style", "background:#ffffff");

    doc = doc.add(
        Text::new(format!("Lineage ({} tracks, {} frames)", rows.len(), frames))
            .set("x", 12)
            .set("y", 28)
            .set("font-family", FONT)
            .set("font-size", 18)
            .set("fill", "#202020"),
    );

    let row_y: HashMap<Label, f32> = rows
        .iter()
        .enumerate()
        .map(|(idx, &label)| (label, TOP + idx as f32 * ROW_H + ROW_H * 0.5))
        .collect();
    let frame_x = |frame: usize| LEFT + frame as f32 * FRAME_W;

    for (&label, track) in graph.tracks() {
        let Some(&py) = row_y.get(&label) else {
            continue;
        };
        let Some(end) = track.last_frame() else {
            continue;
        };
        for daughter in &track.daughters {
            let (Some(&dy), Some(start)) = (
                row_y.get(daughter),
                graph.track(*daughter).and_then(|d| d.first_frame()),
            ) else {
                continue;
            };
            doc = doc.add(
                Line::new()
                    .set("x1", frame_x(end) + FRAME_W)
                    .set("y1", py)
                    .set("x2", frame_x(start))
                    .set("y2", dy)
                    .set("stroke", "#8a8a8a")
                    .set("stroke-width", 1.2),
            );
        }
    }

    for &label in &rows {
        let (Some(track), Some(&y)) = (graph.track(label), row_y.get(&label)) else {
            continue;
        };
        doc = doc.add(
            Text::new(label.to_string())
                .set("x", LEFT - 10.0)
                .set("y", y)
                .set("text-anchor", "end")
                .set("dominant-baseline", "middle")
                .set("font-family", FONT)
                .set("font-size", 12)
                .set("fill", "#101010"),
        );
        for &frame in &track.frames {
            doc = doc.add(
                Rectangle::new()
                    .set("x", frame_x(frame) + 1.0)
                    .set("y", y - 8.0)
                    .set("width", FRAME_W - 2.0)
                    .set("height", 16)
                    .set("fill", "#5a8cd2")
                    .set("stroke", "#3b6aaa")
                    .set("rx", 2),
            );
        }
        if track.capped {
            if let Some(end) = track.last_frame() {
                let x = frame_x(end) + FRAME_W;
                doc = doc.add(
                    Line::new()
                        .set("x1", x)
                        .set("y1", y - 11.0)
                        .set("x2", x)
                        .set("y2", y + 11.0)
                        .set("stroke", "#b03030")
                        .set("stroke-width", 2.5),
                );
            }
        }
    }

    doc.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineage::Track;

    fn track(label: Label, frames: &[usize]) -> Track {
        let mut t = Track::new(label);
        t.frames = frames.iter().copied().collect();
        t
    }

    #[test]
    fn test_row_order_puts_daughters_after_parent() {
        let mut parent = track(1, &[0, 1]);
        parent.daughters = [2, 3].into_iter().collect();
        parent.capped = true;
        let mut d2 = track(2, &[2]);
        d2.parent = Some(1);
        let mut d3 = track(3, &[2]);
        d3.parent = Some(1);
        let graph = LineageGraph::from_tracks([track(4, &[1]), track(6, &[0]), d3, parent, d2]);
        assert_eq!(row_order(&graph), vec![1, 2, 3, 6, 4]);
    }

    #[test]
    fn test_render_lineage_svg_draws_every_track() {
        let mut parent = track(1, &[0, 1]);
        parent.daughters = [2].into_iter().collect();
        parent.capped = true;
        let mut daughter = track(2, &[2, 3]);
        daughter.parent = Some(1);
        let svg = render_lineage_svg(&LineageGraph::from_tracks([parent, daughter]));
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("Lineage (2 tracks, 4 frames)"));
        assert_eq!(svg.matches("<rect").count(), 4);
        // one division edge plus one cap marker
        assert_eq!(svg.matches("<line").count(), 2);
    }

    #[test]
    fn test_render_empty_lineage() {
        let svg = render_lineage_svg(&LineageGraph::new());
        assert!(svg.contains("0 tracks"));
    }
}
