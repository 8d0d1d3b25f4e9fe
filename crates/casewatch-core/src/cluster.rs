//! Geospatial clustering of geolocated cases.
//!
//! A pure batch function: callers pass a snapshot of [`ClusterPoint`]s and
//! get back freshly computed [`Cluster`]s. The input is only borrowed and
//! never mutated; clusters have no identity across runs.
//!
//! # Algorithms
//!
//! | Algorithm | Behavior |
//! |-----------|----------|
//! | [`Density`](ClusterAlgorithm::Density) | neighbor expansion from points with ≥ `min_points` points within `max_distance_km` (the point itself included) |
//! | [`KMeans`](ClusterAlgorithm::KMeans) | `k = min(ceil(n/10), max_k)`, farthest-point seeding, iterate until centroids move < tolerance (degrees) |
//! | [`Hierarchical`](ClusterAlgorithm::Hierarchical) | agglomerative, merges the closest pair of cluster centers until that distance exceeds `max_distance_km` |
//! | [`RiskBased`](ClusterAlgorithm::RiskBased) | greedy: heaviest points first, each absorbs nearby unclustered points up to a size cap |
//!
//! The first three discard groups smaller than `min_points`. The greedy
//! risk variant keeps any seed that found at least `risk_min_neighbors`
//! neighbors, so its clusters may be smaller than `min_points`.
//!
//! Every algorithm assigns each point to at most one cluster.
//!
//! # Point weighting
//!
//! ```text
//! weight = 1
//!        + 2 if age < 18        + 1 if age > 65
//!        + 2 if Missing Children + 1 if Missing Veterans
//!        + 3 / 2 / 1 for Critical / High / Medium risk
//!        + 2 if reported < 7 days ago, else + 1 if < 30 days ago
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::{CaseRecord, Category, RiskLevel};

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres between two lat/lon points (degrees).
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClusterAlgorithm {
    #[default]
    Density,
    KMeans,
    Hierarchical,
    RiskBased,
}

impl FromStr for ClusterAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "density" | "dbscan" => Ok(ClusterAlgorithm::Density),
            "kmeans" | "k-means" | "k_means" => Ok(ClusterAlgorithm::KMeans),
            "hierarchical" => Ok(ClusterAlgorithm::Hierarchical),
            "risk" | "risk_based" | "risk-based" => Ok(ClusterAlgorithm::RiskBased),
            other => Err(format!(
                "Unknown clustering algorithm: '{}'. Must be density, kmeans, hierarchical, or risk.",
                other
            )),
        }
    }
}

impl fmt::Display for ClusterAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterAlgorithm::Density => "density",
            ClusterAlgorithm::KMeans => "kmeans",
            ClusterAlgorithm::Hierarchical => "hierarchical",
            ClusterAlgorithm::RiskBased => "risk",
        };
        f.write_str(s)
    }
}

/// Clustering tuning parameters, decoupled from application config.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterParams {
    pub algorithm: ClusterAlgorithm,
    pub max_distance_km: f64,
    pub min_points: usize,
    pub kmeans_max_k: usize,
    pub kmeans_max_iterations: usize,
    /// Convergence threshold on centroid movement, in degrees.
    pub kmeans_tolerance_deg: f64,
    /// Maximum members of one greedy risk cluster, seed included.
    pub risk_cluster_cap: usize,
    pub risk_seed_min_weight: f64,
    pub risk_min_neighbors: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            algorithm: ClusterAlgorithm::Density,
            max_distance_km: 50.0,
            min_points: 3,
            kmeans_max_k: 20,
            kmeans_max_iterations: 100,
            kmeans_tolerance_deg: 0.001,
            risk_cluster_cap: 21,
            risk_seed_min_weight: 3.0,
            risk_min_neighbors: 2,
        }
    }
}

/// A weighted, geolocated case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterPoint {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub weight: f64,
    pub category: Category,
    /// Id of the backing [`CaseRecord`].
    pub case_id: String,
    pub age: Option<i32>,
    pub reported: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub center_latitude: f64,
    pub center_longitude: f64,
    pub members: Vec<ClusterPoint>,
    pub radius_km: f64,
    pub risk_score: f64,
    pub dominant_category: Category,
    pub patterns: Vec<String>,
    pub insights: Vec<String>,
}

fn days_since(date: Option<NaiveDate>, today: NaiveDate) -> Option<i64> {
    date.map(|d| (today - d).num_days())
}

/// Weight of a case for clustering. See the module docs for the table.
pub fn point_weight(case: &CaseRecord, today: NaiveDate) -> f64 {
    let p = &case.payload;
    let mut weight = 1.0;

    match p.age {
        Some(age) if age < 18 => weight += 2.0,
        Some(age) if age > 65 => weight += 1.0,
        _ => {}
    }
    match p.category {
        Category::MissingChildren => weight += 2.0,
        Category::MissingVeterans => weight += 1.0,
        _ => {}
    }
    match p.risk_level {
        Some(RiskLevel::Critical) => weight += 3.0,
        Some(RiskLevel::High) => weight += 2.0,
        Some(RiskLevel::Medium) => weight += 1.0,
        _ => {}
    }
    match days_since(p.date_reported.or(p.date_missing), today) {
        Some(days) if days < 7 => weight += 2.0,
        Some(days) if days < 30 => weight += 1.0,
        _ => {}
    }
    weight
}

/// Convert geolocated cases into weighted points. Cases without
/// coordinates are skipped.
pub fn points_from_cases(cases: &[CaseRecord], today: NaiveDate) -> Vec<ClusterPoint> {
    cases
        .iter()
        .filter_map(|case| {
            let (lat, lon) = case.coordinates()?;
            Some(ClusterPoint {
                id: format!("pt-{}", case.id),
                latitude: lat,
                longitude: lon,
                weight: point_weight(case, today),
                category: case.payload.category,
                case_id: case.id.clone(),
                age: case.payload.age,
                reported: case.payload.date_reported.or(case.payload.date_missing),
            })
        })
        .collect()
}

/// Run the configured algorithm and finalize the resulting groups.
///
/// Clusters are returned ordered by descending risk score and numbered
/// `cluster-1`, `cluster-2`, ... in that order.
pub fn cluster_points(
    points: &[ClusterPoint],
    params: &ClusterParams,
    today: NaiveDate,
) -> Vec<Cluster> {
    if points.is_empty() {
        return Vec::new();
    }

    let groups = match params.algorithm {
        ClusterAlgorithm::Density => density_groups(points, params),
        ClusterAlgorithm::KMeans => kmeans_groups(points, params),
        ClusterAlgorithm::Hierarchical => hierarchical_groups(points, params),
        ClusterAlgorithm::RiskBased => risk_groups(points, params),
    };

    let mut clusters: Vec<Cluster> = groups
        .into_iter()
        .filter(|g| !g.is_empty())
        .map(|g| finalize(points, &g, today))
        .collect();

    clusters.sort_by(|a, b| b.risk_score.total_cmp(&a.risk_score));
    for (i, cluster) in clusters.iter_mut().enumerate() {
        cluster.id = format!("cluster-{}", i + 1);
    }
    clusters
}

fn distance(a: &ClusterPoint, b: &ClusterPoint) -> f64 {
    haversine_km(a.latitude, a.longitude, b.latitude, b.longitude)
}

// ============ Density-based ============

fn region(points: &[ClusterPoint], idx: usize, max_km: f64) -> Vec<usize> {
    (0..points.len())
        .filter(|&j| distance(&points[idx], &points[j]) <= max_km)
        .collect()
}

fn density_groups(points: &[ClusterPoint], params: &ClusterParams) -> Vec<Vec<usize>> {
    let n = points.len();
    let mut visited = vec![false; n];
    let mut assigned = vec![false; n];
    let mut groups = Vec::new();

    for i in 0..n {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        let neighbors = region(points, i, params.max_distance_km);
        if neighbors.len() < params.min_points {
            continue;
        }

        let mut group = vec![i];
        assigned[i] = true;
        let mut seeds = neighbors;
        let mut cursor = 0;
        while cursor < seeds.len() {
            let q = seeds[cursor];
            cursor += 1;
            if !visited[q] {
                visited[q] = true;
                let q_neighbors = region(points, q, params.max_distance_km);
                if q_neighbors.len() >= params.min_points {
                    seeds.extend(q_neighbors);
                }
            }
            if !assigned[q] {
                assigned[q] = true;
                group.push(q);
            }
        }
        groups.push(group);
    }

    groups
        .into_iter()
        .filter(|g| g.len() >= params.min_points)
        .collect()
}

// ============ K-means ============

fn kmeans_groups(points: &[ClusterPoint], params: &ClusterParams) -> Vec<Vec<usize>> {
    let n = points.len();
    let k = n.div_ceil(10).min(params.kmeans_max_k).max(1);

    // Seed with the heaviest point, then repeatedly the point farthest from
    // every chosen centroid.
    let first = (0..n).fold(0, |best, i| {
        if points[i].weight > points[best].weight {
            i
        } else {
            best
        }
    });
    let mut centroids: Vec<(f64, f64)> = vec![(points[first].latitude, points[first].longitude)];
    while centroids.len() < k {
        let mut best_idx = 0;
        let mut best_dist = -1.0;
        for (i, p) in points.iter().enumerate() {
            let nearest = centroids
                .iter()
                .map(|&(lat, lon)| haversine_km(p.latitude, p.longitude, lat, lon))
                .fold(f64::INFINITY, f64::min);
            if nearest > best_dist {
                best_dist = nearest;
                best_idx = i;
            }
        }
        centroids.push((points[best_idx].latitude, points[best_idx].longitude));
    }

    let mut assignment = vec![0usize; n];
    for _ in 0..params.kmeans_max_iterations {
        for (i, p) in points.iter().enumerate() {
            assignment[i] = nearest_centroid(p, &centroids);
        }

        let mut max_shift: f64 = 0.0;
        for (c, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<&ClusterPoint> = points
                .iter()
                .zip(&assignment)
                .filter(|&(_, &a)| a == c)
                .map(|(p, _)| p)
                .collect();
            if members.is_empty() {
                continue;
            }
            let lat = members.iter().map(|p| p.latitude).sum::<f64>() / members.len() as f64;
            let lon = members.iter().map(|p| p.longitude).sum::<f64>() / members.len() as f64;
            let shift = ((lat - centroid.0).powi(2) + (lon - centroid.1).powi(2)).sqrt();
            max_shift = max_shift.max(shift);
            *centroid = (lat, lon);
        }

        if max_shift < params.kmeans_tolerance_deg {
            break;
        }
    }

    // Final assignment against the settled centroids.
    for (i, p) in points.iter().enumerate() {
        assignment[i] = nearest_centroid(p, &centroids);
    }

    (0..k)
        .map(|c| (0..n).filter(|&i| assignment[i] == c).collect::<Vec<_>>())
        .filter(|g| g.len() >= params.min_points)
        .collect()
}

fn nearest_centroid(p: &ClusterPoint, centroids: &[(f64, f64)]) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (c, &(lat, lon)) in centroids.iter().enumerate() {
        let d = haversine_km(p.latitude, p.longitude, lat, lon);
        if d < best_dist {
            best_dist = d;
            best = c;
        }
    }
    best
}

// ============ Hierarchical ============

fn weighted_center(points: &[ClusterPoint], members: &[usize]) -> (f64, f64) {
    let total: f64 = members.iter().map(|&i| points[i].weight).sum();
    if total <= 0.0 {
        let n = members.len().max(1) as f64;
        let lat = members.iter().map(|&i| points[i].latitude).sum::<f64>() / n;
        let lon = members.iter().map(|&i| points[i].longitude).sum::<f64>() / n;
        return (lat, lon);
    }
    let lat = members
        .iter()
        .map(|&i| points[i].latitude * points[i].weight)
        .sum::<f64>()
        / total;
    let lon = members
        .iter()
        .map(|&i| points[i].longitude * points[i].weight)
        .sum::<f64>()
        / total;
    (lat, lon)
}

fn hierarchical_groups(points: &[ClusterPoint], params: &ClusterParams) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = (0..points.len()).map(|i| vec![i]).collect();
    let mut centers: Vec<(f64, f64)> = points.iter().map(|p| (p.latitude, p.longitude)).collect();

    while groups.len() > 1 {
        let mut closest: Option<(usize, usize, f64)> = None;
        for a in 0..groups.len() {
            for b in (a + 1)..groups.len() {
                let d = haversine_km(centers[a].0, centers[a].1, centers[b].0, centers[b].1);
                if closest.map_or(true, |(_, _, best)| d < best) {
                    closest = Some((a, b, d));
                }
            }
        }

        let Some((a, b, d)) = closest else { break };
        if d > params.max_distance_km {
            break;
        }

        let absorbed = groups.swap_remove(b);
        centers.swap_remove(b);
        groups[a].extend(absorbed);
        centers[a] = weighted_center(points, &groups[a]);
    }

    groups
        .into_iter()
        .filter(|g| g.len() >= params.min_points)
        .collect()
}

// ============ Risk-based greedy ============

fn risk_groups(points: &[ClusterPoint], params: &ClusterParams) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..points.len()).collect();
    order.sort_by(|&a, &b| points[b].weight.total_cmp(&points[a].weight));

    let mut assigned = vec![false; points.len()];
    let mut groups = Vec::new();
    let cap = params.risk_cluster_cap.max(1);

    for &seed in &order {
        if assigned[seed] || points[seed].weight < params.risk_seed_min_weight {
            continue;
        }

        let mut neighbors: Vec<(usize, f64)> = (0..points.len())
            .filter(|&j| j != seed && !assigned[j])
            .map(|j| (j, distance(&points[seed], &points[j])))
            .filter(|&(_, d)| d <= params.max_distance_km)
            .collect();
        neighbors.sort_by(|a, b| a.1.total_cmp(&b.1));
        neighbors.truncate(cap - 1);

        if neighbors.len() < params.risk_min_neighbors {
            continue;
        }

        let mut group = Vec::with_capacity(neighbors.len() + 1);
        group.push(seed);
        group.extend(neighbors.into_iter().map(|(j, _)| j));
        for &i in &group {
            assigned[i] = true;
        }
        groups.push(group);
    }
    groups
}

// ============ Finalization ============

fn finalize(points: &[ClusterPoint], group: &[usize], today: NaiveDate) -> Cluster {
    let members: Vec<ClusterPoint> = group.iter().map(|&i| points[i].clone()).collect();
    let (center_lat, center_lon) = weighted_center(points, group);

    let radius_km = members
        .iter()
        .map(|m| haversine_km(center_lat, center_lon, m.latitude, m.longitude))
        .fold(0.0, f64::max);
    let risk_score = members.iter().map(|m| m.weight).sum::<f64>() / members.len() as f64;

    let mut votes: BTreeMap<Category, usize> = BTreeMap::new();
    for m in &members {
        *votes.entry(m.category).or_default() += 1;
    }
    let mut dominant_category = members[0].category;
    let mut best = 0;
    for (category, count) in votes {
        if count > best {
            best = count;
            dominant_category = category;
        }
    }

    let (patterns, insights) = tags(&members, risk_score, today);

    Cluster {
        id: String::new(),
        center_latitude: center_lat,
        center_longitude: center_lon,
        members,
        radius_km,
        risk_score,
        dominant_category,
        patterns,
        insights,
    }
}

fn tags(members: &[ClusterPoint], risk_score: f64, today: NaiveDate) -> (Vec<String>, Vec<String>) {
    let n = members.len() as f64;
    let mut patterns = Vec::new();
    let mut insights = Vec::new();

    let ages: Vec<i32> = members.iter().filter_map(|m| m.age).collect();
    if !ages.is_empty() {
        let mean = ages.iter().map(|&a| f64::from(a)).sum::<f64>() / ages.len() as f64;
        if mean < 18.0 {
            patterns.push("Youth concentration".to_string());
        }
    }

    let recent = members
        .iter()
        .filter(|m| matches!(days_since(m.reported, today), Some(d) if d < 30))
        .count() as f64;
    if recent / n > 0.5 {
        patterns.push("Recent activity surge".to_string());
    }

    if members.iter().any(|m| m.category == Category::AmberAlert) {
        patterns.push("Active AMBER alert".to_string());
    }

    if members.len() > 10 {
        insights.push("Significant case concentration".to_string());
    }

    let children = members
        .iter()
        .filter(|m| m.category == Category::MissingChildren)
        .count() as f64;
    if children / n > 0.6 {
        insights.push("Children safety hotspot".to_string());
    }

    if risk_score >= 5.0 {
        insights.push("Elevated average risk".to_string());
    }

    (patterns, insights)
}
