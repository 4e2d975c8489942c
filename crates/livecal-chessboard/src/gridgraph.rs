use crate::geom::{classify_edge, dominant_grid_axis, NeighborDirection};
use crate::params::GridGraphParams;
use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Point2, Vector2};
use std::collections::{HashMap, VecDeque};

#[derive(Clone, Debug)]
pub struct NodeNeighbor {
    pub direction: NeighborDirection,
    pub index: usize,
    pub distance: f32,
    pub score: f32,
}

/// 4-connected neighbor graph over corner positions, with edges oriented
/// along the dominant grid axes.
pub struct GridGraph {
    pub axis: f32,
    pub neighbors: Vec<Vec<NodeNeighbor>>,
}

/// Keep at most one neighbor per direction, choosing the lowest-score candidate.
fn select_neighbors(candidates: Vec<NodeNeighbor>) -> Vec<NodeNeighbor> {
    let mut best: [Option<NodeNeighbor>; 4] = [None, None, None, None];
    for candidate in candidates {
        let slot = &mut best[candidate.direction.slot()];
        let replace = match slot {
            None => true,
            Some(current) => {
                candidate.score < current.score
                    || (candidate.score == current.score && candidate.distance < current.distance)
            }
        };
        if replace {
            *slot = Some(candidate);
        }
    }
    best.into_iter().flatten().collect()
}

fn opposite(d: NeighborDirection) -> NeighborDirection {
    match d {
        NeighborDirection::Right => NeighborDirection::Left,
        NeighborDirection::Left => NeighborDirection::Right,
        NeighborDirection::Up => NeighborDirection::Down,
        NeighborDirection::Down => NeighborDirection::Up,
    }
}

impl GridGraph {
    /// Build the graph; returns `None` when no dominant grid axis exists.
    pub fn new(points: &[Point2<f32>], params: &GridGraphParams) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }
        let coords = points.iter().map(|p| [p.x, p.y]).collect::<Vec<_>>();
        let tree: KdTree<f32, 2> = (&coords).into();
        let k = params.k_neighbors.max(2).min(points.len());

        // Candidates within the spacing window, nearest first.
        let mut candidates: Vec<Vec<(usize, f32)>> = Vec::with_capacity(points.len());
        for (i, q) in coords.iter().enumerate() {
            let mut list = Vec::with_capacity(k);
            for nn in tree.nearest_n::<SquaredEuclidean>(q, k) {
                let j = nn.item as usize;
                if j == i {
                    continue;
                }
                let d = nn.distance.sqrt();
                if d < params.min_spacing_pix || d > params.max_spacing_pix {
                    continue;
                }
                list.push((j, d));
            }
            list.sort_by(|a, b| a.1.total_cmp(&b.1));
            candidates.push(list);
        }

        let nearest_edges: Vec<Vector2<f32>> = candidates
            .iter()
            .enumerate()
            .filter_map(|(i, list)| list.first().map(|&(j, _)| points[j] - points[i]))
            .collect();
        let axis = dominant_grid_axis(&nearest_edges)?;
        let tol = params.axis_tolerance_deg.to_radians();

        let mut directed: Vec<Vec<NodeNeighbor>> = Vec::with_capacity(points.len());
        for (i, list) in candidates.iter().enumerate() {
            let Some(&(_, nearest)) = list.first() else {
                directed.push(Vec::new());
                continue;
            };
            let mut node = Vec::new();
            for &(j, distance) in list {
                if distance > params.spacing_ratio * nearest {
                    break;
                }
                let edge = points[j] - points[i];
                let Some(direction) = classify_edge(axis, &edge, tol) else {
                    continue;
                };
                node.push(NodeNeighbor {
                    direction,
                    index: j,
                    distance,
                    score: distance / nearest,
                });
            }
            directed.push(select_neighbors(node));
        }

        // Keep only mutual edges so BFS coordinates stay consistent.
        let neighbors = directed
            .iter()
            .enumerate()
            .map(|(i, list)| {
                list.iter()
                    .filter(|n| {
                        directed[n.index]
                            .iter()
                            .any(|back| back.index == i && back.direction == opposite(n.direction))
                    })
                    .cloned()
                    .collect()
            })
            .collect();

        Some(Self { axis, neighbors })
    }
}

pub fn connected_components(graph: &GridGraph) -> Vec<Vec<usize>> {
    let mut visited = vec![false; graph.neighbors.len()];
    let mut components = Vec::new();

    for start in 0..graph.neighbors.len() {
        if visited[start] {
            continue;
        }
        let mut component = Vec::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if visited[node] {
                continue;
            }
            visited[node] = true;
            component.push(node);
            for neighbor in &graph.neighbors[node] {
                if !visited[neighbor.index] {
                    stack.push(neighbor.index);
                }
            }
        }
        components.push(component);
    }
    components
}

/// Integer grid coordinates `(u, v) -> node` for one component.
///
/// Returns `None` if the walk is inconsistent (a node reached at two
/// different coordinates, or two nodes at the same coordinate).
pub fn assign_grid_coordinates(
    graph: &GridGraph,
    component: &[usize],
) -> Option<HashMap<(i32, i32), usize>> {
    let start = *component.first()?;
    let mut node_coords: HashMap<usize, (i32, i32)> = HashMap::with_capacity(component.len());
    let mut by_coord: HashMap<(i32, i32), usize> = HashMap::with_capacity(component.len());
    let mut queue = VecDeque::new();
    queue.push_back((start, 0, 0));

    while let Some((node, u, v)) = queue.pop_front() {
        if let Some(&prev) = node_coords.get(&node) {
            if prev != (u, v) {
                return None;
            }
            continue;
        }
        if by_coord.insert((u, v), node).is_some() {
            return None;
        }
        node_coords.insert(node, (u, v));

        for neighbor in &graph.neighbors[node] {
            let (du, dv) = neighbor.direction.step();
            queue.push_back((neighbor.index, u + du, v + dv));
        }
    }
    Some(by_coord)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(cols: usize, rows: usize, spacing: f32, angle: f32) -> Vec<Point2<f32>> {
        let (s, c) = angle.sin_cos();
        let mut pts = Vec::new();
        for r in 0..rows {
            for k in 0..cols {
                let x = k as f32 * spacing;
                let y = r as f32 * spacing;
                pts.push(Point2::new(200.0 + c * x - s * y, 150.0 + s * x + c * y));
            }
        }
        pts
    }

    fn dirs(graph: &GridGraph, node: usize) -> HashMap<NeighborDirection, usize> {
        graph.neighbors[node]
            .iter()
            .map(|n| (n.direction, n.index))
            .collect()
    }

    #[test]
    fn finds_axis_neighbors_in_regular_grid() {
        let pts = grid(3, 3, 20.0, 0.0);
        let graph = GridGraph::new(&pts, &GridGraphParams::default()).expect("graph");
        let idx = |c: usize, r: usize| r * 3 + c;

        let center = dirs(&graph, idx(1, 1));
        assert_eq!(center.len(), 4);
        assert_eq!(center[&NeighborDirection::Left], idx(0, 1));
        assert_eq!(center[&NeighborDirection::Right], idx(2, 1));
        assert_eq!(center[&NeighborDirection::Up], idx(1, 0));
        assert_eq!(center[&NeighborDirection::Down], idx(1, 2));

        let corner = dirs(&graph, idx(0, 0));
        assert_eq!(corner.len(), 2);
    }

    #[test]
    fn rotated_grid_forms_one_consistent_component() {
        let pts = grid(7, 5, 30.0, 0.6);
        let graph = GridGraph::new(&pts, &GridGraphParams::default()).expect("graph");
        let comps = connected_components(&graph);
        assert_eq!(comps.len(), 1);
        let coords = assign_grid_coordinates(&graph, &comps[0]).expect("consistent");
        assert_eq!(coords.len(), 35);
        let (umin, umax) = coords.keys().fold((i32::MAX, i32::MIN), |acc, k| {
            (acc.0.min(k.0), acc.1.max(k.0))
        });
        let (vmin, vmax) = coords.keys().fold((i32::MAX, i32::MIN), |acc, k| {
            (acc.0.min(k.1), acc.1.max(k.1))
        });
        let spans = [(umax - umin + 1) as usize, (vmax - vmin + 1) as usize];
        assert!(spans == [7, 5] || spans == [5, 7]);
    }

    #[test]
    fn far_outlier_stays_isolated() {
        let mut pts = grid(4, 4, 20.0, 0.1);
        pts.push(Point2::new(900.0, 900.0));
        let graph = GridGraph::new(&pts, &GridGraphParams::default()).expect("graph");
        assert!(graph.neighbors[16].is_empty());
    }
}
