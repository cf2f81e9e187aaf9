//! Product quantization: the PQ flat-code index and the IVFPQ inverted-file
//! index on top of it.
//!
//! Training is a one-time operation. Vectors are split into `M` sub-vectors
//! of `D / M` floats; each sub-space gets a k-means codebook of `2^nbits`
//! centroids, so a stored vector compresses to `M` code bytes. IVFPQ first
//! assigns a vector to one of `nlist` coarse centroids and encodes the
//! residual into that centroid's inverted list. Search uses asymmetric
//! distance computation: an `M x 2^nbits` table of partial distances from
//! the query, summed by table lookup per stored code.

use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_derive::{Deserialize, Serialize};

use crate::distance::{self, Distance};
use crate::error::{CResult, Error};
use crate::index::{Neighbor, ResultHeap, RowFilter, VectorIndex};
use crate::storage::store::VectorStore;

/// Flat product-quantizer parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PqConfig {
    /// Sub-quantizer count; must divide the dimension.
    pub m: usize,

    /// Bits per code, at most 8. 8 gives the usual 256-centroid codebooks.
    pub nbits: usize,

    /// Lloyd iterations per k-means run.
    pub train_iters: usize,

    pub seed: u64,
}

impl Default for PqConfig {
    fn default() -> Self {
        Self { m: 8, nbits: 8, train_iters: 25, seed: 0x9e3779b9 }
    }
}

/// Inverted-file parameters; the PQ fields mirror [`PqConfig`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IvfPqConfig {
    /// Coarse centroid count.
    pub nlist: usize,

    /// Coarse lists probed per query.
    pub nprobe: usize,

    pub m: usize,
    pub nbits: usize,
    pub train_iters: usize,
    pub seed: u64,
}

impl Default for IvfPqConfig {
    fn default() -> Self {
        Self { nlist: 64, nprobe: 8, m: 8, nbits: 8, train_iters: 25, seed: 0x9e3779b9 }
    }
}

/// Lloyd's k-means with k-means++ seeding over `points`, returning `k`
/// centroids as a flat `k * dim` buffer. Empty clusters are reseeded from a
/// random point.
pub(crate) fn kmeans(
    points: &[Vec<f32>],
    dim: usize,
    k: usize,
    iters: usize,
    rng: &mut StdRng,
) -> CResult<Vec<f32>> {
    if points.is_empty() {
        return Err(Error::InvalidInput("k-means requires at least one point".into()));
    }
    let k = k.min(points.len()).max(1);

    // k-means++: the first centroid uniformly, the rest proportional to the
    // squared distance from the nearest chosen centroid.
    let mut centroids: Vec<f32> = Vec::with_capacity(k * dim);
    let first = rng.gen_range(0..points.len());
    centroids.extend_from_slice(&points[first]);
    let mut dists: Vec<f32> = points
        .iter()
        .map(|p| distance::euclidean_squared(p, &points[first]))
        .collect();
    while centroids.len() / dim < k {
        let total: f32 = dists.iter().sum();
        let pick = if total <= f32::EPSILON {
            rng.gen_range(0..points.len())
        } else {
            let mut target = rng.gen_range(0.0..total);
            let mut chosen = points.len() - 1;
            for (i, d) in dists.iter().enumerate() {
                if target < *d {
                    chosen = i;
                    break;
                }
                target -= d;
            }
            chosen
        };
        centroids.extend_from_slice(&points[pick]);
        let base = centroids.len() - dim;
        let new_centroid = centroids[base..].to_vec();
        for (i, p) in points.iter().enumerate() {
            let d = distance::euclidean_squared(p, &new_centroid);
            if d < dists[i] {
                dists[i] = d;
            }
        }
    }

    let mut assignment = vec![0usize; points.len()];
    for _ in 0..iters {
        // Assign.
        let mut moved = false;
        for (i, p) in points.iter().enumerate() {
            let (best, _) = nearest_centroid(p, &centroids, dim);
            if assignment[i] != best {
                assignment[i] = best;
                moved = true;
            }
        }
        // Recompute.
        let mut sums = vec![0.0f32; k * dim];
        let mut counts = vec![0usize; k];
        for (i, p) in points.iter().enumerate() {
            let c = assignment[i];
            counts[c] += 1;
            for (j, x) in p.iter().enumerate() {
                sums[c * dim + j] += x;
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                let pick = rng.gen_range(0..points.len());
                centroids[c * dim..(c + 1) * dim].copy_from_slice(&points[pick]);
                continue;
            }
            for j in 0..dim {
                centroids[c * dim + j] = sums[c * dim + j] / counts[c] as f32;
            }
        }
        if !moved {
            break;
        }
    }
    Ok(centroids)
}

/// Nearest centroid in a flat `k * dim` buffer, by squared euclidean.
fn nearest_centroid(point: &[f32], centroids: &[f32], dim: usize) -> (usize, f32) {
    let k = centroids.len() / dim;
    let mut best = 0usize;
    let mut best_d = f32::INFINITY;
    for c in 0..k {
        let d = distance::euclidean_squared(point, &centroids[c * dim..(c + 1) * dim]);
        if d < best_d {
            best_d = d;
            best = c;
        }
    }
    (best, best_d)
}

/// The additive partial distance between a query sub-vector and a codebook
/// centroid. Summing partials over sub-spaces approximates the full metric;
/// cosine queries are pre-normalized and use negated dot partials.
fn partial(metric: Distance, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        Distance::Euclidean => distance::euclidean_squared(a, b),
        Distance::Cosine | Distance::DotProduct => -distance::dot(a, b),
        _ => metric.compute(a, b),
    }
}

/// Folds the summed partials into the metric's reported distance.
fn finish(metric: Distance, sum: f32) -> f32 {
    match metric {
        Distance::Euclidean => sum.sqrt(),
        Distance::Cosine => 1.0 + sum,
        _ => sum,
    }
}

/// A per-sub-space codebook set trained by [`kmeans`]. Shared by PQ and
/// IVFPQ.
#[derive(Clone, Serialize, Deserialize)]
struct Codebooks {
    m: usize,
    dsub: usize,
    ksub: usize,
    /// `m` codebooks, each `ksub * dsub` floats.
    books: Vec<Vec<f32>>,
}

impl Codebooks {
    fn train(
        vectors: &[Vec<f32>],
        m: usize,
        dsub: usize,
        ksub: usize,
        iters: usize,
        rng: &mut StdRng,
    ) -> CResult<Self> {
        let mut books = Vec::with_capacity(m);
        for sub in 0..m {
            let subs: Vec<Vec<f32>> = vectors
                .iter()
                .map(|v| v[sub * dsub..(sub + 1) * dsub].to_vec())
                .collect();
            books.push(kmeans(&subs, dsub, ksub, iters, rng)?);
        }
        Ok(Self { m, dsub, ksub, books })
    }

    fn encode(&self, vector: &[f32]) -> Vec<u8> {
        let mut code = Vec::with_capacity(self.m);
        for sub in 0..self.m {
            let slice = &vector[sub * self.dsub..(sub + 1) * self.dsub];
            let (best, _) = nearest_centroid(slice, &self.books[sub], self.dsub);
            code.push(best as u8);
        }
        code
    }

    /// The `m * ksub` ADC lookup table for one query (or query residual).
    fn adc_table(&self, metric: Distance, query: &[f32]) -> Vec<f32> {
        let mut table = vec![0.0f32; self.m * self.ksub];
        for sub in 0..self.m {
            let q = &query[sub * self.dsub..(sub + 1) * self.dsub];
            let book = &self.books[sub];
            let centroids = book.len() / self.dsub;
            for c in 0..centroids {
                table[sub * self.ksub + c] =
                    partial(metric, q, &book[c * self.dsub..(c + 1) * self.dsub]);
            }
        }
        table
    }

    fn adc_sum(&self, table: &[f32], code: &[u8]) -> f32 {
        let mut sum = 0.0f32;
        for (sub, &c) in code.iter().enumerate() {
            sum += table[sub * self.ksub + c as usize];
        }
        sum
    }
}

fn validate_pq_shape(dim: usize, m: usize, nbits: usize) -> CResult<usize> {
    if dim == 0 {
        return Err(Error::InvalidInput("dimension must be at least 1".into()));
    }
    if m == 0 || dim % m != 0 {
        return Err(Error::InvalidInput(format!(
            "sub-quantizer count {} must divide dimension {}",
            m, dim
        )));
    }
    if nbits == 0 || nbits > 8 {
        return Err(Error::InvalidInput("nbits must be between 1 and 8".into()));
    }
    Ok(dim / m)
}

/// Normalizes a cosine query once; other metrics pass through.
fn query_for(metric: Distance, query: &[f32]) -> Vec<f32> {
    if metric == Distance::Cosine {
        let n = distance::norm(query);
        if n > 0.0 {
            return query.iter().map(|x| x / n).collect();
        }
    }
    query.to_vec()
}

// ---------------------------------------------------------------------------
// PQ
// ---------------------------------------------------------------------------

pub struct PqIndex {
    dim: usize,
    metric: Distance,
    config: PqConfig,
    codebooks: Option<Codebooks>,
    /// Row to code bytes. BTreeMap keeps scans deterministic.
    codes: BTreeMap<u64, Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct PqState {
    dim: u32,
    metric: Distance,
    config: PqConfig,
    codebooks: Option<Codebooks>,
    codes: BTreeMap<u64, Vec<u8>>,
}

impl PqIndex {
    pub fn new(dim: usize, metric: Distance, config: PqConfig) -> CResult<Self> {
        validate_pq_shape(dim, config.m, config.nbits)?;
        Ok(Self { dim, metric, config, codebooks: None, codes: BTreeMap::new() })
    }

    fn books(&self) -> CResult<&Codebooks> {
        self.codebooks.as_ref().ok_or(Error::Untrained)
    }

    fn check_query(&self, query: &[f32]) -> CResult<()> {
        if query.len() != self.dim {
            return Err(Error::InvalidInput(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dim
            )));
        }
        Ok(())
    }

    fn scan(
        &self,
        store: &VectorStore,
        query: &[f32],
        metric: Distance,
        filter: Option<&RowFilter>,
        mut visit: impl FnMut(u64, f32),
    ) -> CResult<()> {
        self.check_query(query)?;
        let books = self.books()?;
        let query = query_for(metric, query);
        let table = books.adc_table(metric, &query);
        for (&row, code) in &self.codes {
            if store.is_deleted(row) {
                continue;
            }
            if let Some(filter) = filter {
                if !filter(row) {
                    continue;
                }
            }
            visit(row, finish(metric, books.adc_sum(&table, code)));
        }
        Ok(())
    }

    pub fn load(r: &mut dyn Read, dim: usize) -> CResult<Self> {
        let state: PqState = bincode::deserialize_from(r)?;
        if state.dim as usize != dim {
            return Err(Error::Corrupted(format!(
                "pq index dimension {} does not match database dimension {}",
                state.dim, dim
            )));
        }
        let mut index = Self::new(dim, state.metric, state.config)?;
        index.codebooks = state.codebooks;
        index.codes = state.codes;
        Ok(index)
    }
}

impl VectorIndex for PqIndex {
    fn insert(&mut self, store: &VectorStore, row: u64) -> CResult<()> {
        let code = self.books()?.encode(store.get(row)?);
        self.codes.insert(row, code);
        Ok(())
    }

    fn remove(&mut self, row: u64) -> CResult<()> {
        self.codes
            .remove(&row)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("row {} not in index", row)))
    }

    fn update(&mut self, store: &VectorStore, row: u64) -> CResult<()> {
        if !self.codes.contains_key(&row) {
            return Err(Error::NotFound(format!("row {} not in index", row)));
        }
        let code = self.books()?.encode(store.get(row)?);
        self.codes.insert(row, code);
        Ok(())
    }

    fn search(
        &self,
        store: &VectorStore,
        query: &[f32],
        k: usize,
        metric: Distance,
        filter: Option<&RowFilter>,
    ) -> CResult<Vec<Neighbor>> {
        let mut heap = ResultHeap::new(k);
        self.scan(store, query, metric, filter, |row, distance| heap.push(row, distance))?;
        Ok(heap.into_sorted())
    }

    fn range_search(
        &self,
        store: &VectorStore,
        query: &[f32],
        radius: f32,
        metric: Distance,
        filter: Option<&RowFilter>,
    ) -> CResult<Vec<Neighbor>> {
        let mut out = Vec::new();
        self.scan(store, query, metric, filter, |row, distance| {
            if distance <= radius {
                out.push(Neighbor { row, distance });
            }
        })?;
        out.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.row.cmp(&b.row)));
        Ok(out)
    }

    fn len(&self) -> usize {
        self.codes.len()
    }

    fn train(&mut self, vectors: &[Vec<f32>]) -> CResult<()> {
        if self.codebooks.is_some() {
            return Err(Error::InvalidInput("index is already trained".into()));
        }
        if vectors.is_empty() {
            return Err(Error::InvalidInput("training set is empty".into()));
        }
        if vectors.iter().any(|v| v.len() != self.dim) {
            return Err(Error::InvalidInput("training vector dimension mismatch".into()));
        }
        let dsub = self.dim / self.config.m;
        let ksub = 1 << self.config.nbits;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        self.codebooks = Some(Codebooks::train(
            vectors,
            self.config.m,
            dsub,
            ksub,
            self.config.train_iters,
            &mut rng,
        )?);
        Ok(())
    }

    fn is_trained(&self) -> bool {
        self.codebooks.is_some()
    }

    fn rebuild(&mut self, store: &VectorStore) -> CResult<()> {
        let books = self.books()?.clone();
        self.codes.clear();
        for row in store.live_indices() {
            let code = books.encode(store.get(row)?);
            self.codes.insert(row, code);
        }
        Ok(())
    }

    fn save(&self, w: &mut dyn Write) -> CResult<()> {
        let state = PqState {
            dim: self.dim as u32,
            metric: self.metric,
            config: self.config.clone(),
            codebooks: self.codebooks.clone(),
            codes: self.codes.clone(),
        };
        bincode::serialize_into(w, &state)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// IVFPQ
// ---------------------------------------------------------------------------

pub struct IvfPqIndex {
    dim: usize,
    metric: Distance,
    config: IvfPqConfig,

    /// `nlist * dim` coarse centroids, set by training.
    coarse: Option<Vec<f32>>,
    codebooks: Option<Codebooks>,

    /// One inverted list per coarse centroid: `(row, code)` entries.
    lists: Vec<Vec<(u64, Vec<u8>)>>,

    /// Which list a row landed in, for update relocation.
    row_list: BTreeMap<u64, usize>,

    /// Tombstoned rows, suppressed at search.
    deleted: HashSet<u64>,
}

#[derive(Serialize, Deserialize)]
struct IvfPqState {
    dim: u32,
    metric: Distance,
    config: IvfPqConfig,
    coarse: Option<Vec<f32>>,
    codebooks: Option<Codebooks>,
    lists: Vec<Vec<(u64, Vec<u8>)>>,
    row_list: BTreeMap<u64, usize>,
    deleted: Vec<u64>,
}

impl IvfPqIndex {
    pub fn new(dim: usize, metric: Distance, config: IvfPqConfig) -> CResult<Self> {
        validate_pq_shape(dim, config.m, config.nbits)?;
        if config.nlist == 0 {
            return Err(Error::InvalidInput("nlist must be at least 1".into()));
        }
        if config.nprobe == 0 || config.nprobe > config.nlist {
            return Err(Error::InvalidInput(format!(
                "nprobe {} must be between 1 and nlist {}",
                config.nprobe, config.nlist
            )));
        }
        let lists = vec![Vec::new(); config.nlist];
        Ok(Self {
            dim,
            metric,
            config,
            coarse: None,
            codebooks: None,
            lists,
            row_list: BTreeMap::new(),
            deleted: HashSet::new(),
        })
    }

    fn quantizers(&self) -> CResult<(&[f32], &Codebooks)> {
        match (&self.coarse, &self.codebooks) {
            (Some(coarse), Some(books)) => Ok((coarse, books)),
            _ => Err(Error::Untrained),
        }
    }

    fn check_query(&self, query: &[f32]) -> CResult<()> {
        if query.len() != self.dim {
            return Err(Error::InvalidInput(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dim
            )));
        }
        Ok(())
    }

    fn residual(vector: &[f32], centroid: &[f32]) -> Vec<f32> {
        vector.iter().zip(centroid.iter()).map(|(v, c)| v - c).collect()
    }

    fn encode_into_list(&mut self, row: u64, vector: &[f32]) -> CResult<()> {
        let (list, code) = {
            let (coarse, books) = self.quantizers()?;
            let (list, _) = nearest_centroid(vector, coarse, self.dim);
            let centroid = &coarse[list * self.dim..(list + 1) * self.dim];
            (list, books.encode(&Self::residual(vector, centroid)))
        };
        self.lists[list].push((row, code));
        self.row_list.insert(row, list);
        Ok(())
    }

    fn scan(
        &self,
        store: &VectorStore,
        query: &[f32],
        metric: Distance,
        nprobe: usize,
        filter: Option<&RowFilter>,
        mut visit: impl FnMut(u64, f32),
    ) -> CResult<()> {
        self.check_query(query)?;
        let (coarse, books) = self.quantizers()?;
        let nprobe = nprobe.clamp(1, self.config.nlist);
        let query = query_for(metric, query);

        // Rank coarse lists by centroid distance and probe the best nprobe.
        let mut ranked: Vec<(f32, usize)> = (0..self.config.nlist)
            .map(|l| {
                let c = &coarse[l * self.dim..(l + 1) * self.dim];
                (distance::euclidean_squared(&query, c), l)
            })
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));

        for &(_, list) in ranked.iter().take(nprobe) {
            if self.lists[list].is_empty() {
                continue;
            }
            let centroid = &coarse[list * self.dim..(list + 1) * self.dim];
            let table = books.adc_table(metric, &Self::residual(&query, centroid));
            for (row, code) in &self.lists[list] {
                if self.deleted.contains(row) || store.is_deleted(*row) {
                    continue;
                }
                if let Some(filter) = filter {
                    if !filter(*row) {
                        continue;
                    }
                }
                visit(*row, finish(metric, books.adc_sum(&table, code)));
            }
        }
        Ok(())
    }

    /// Search with an explicit probe count, letting the query planner widen
    /// or narrow the default.
    pub fn search_with_nprobe(
        &self,
        store: &VectorStore,
        query: &[f32],
        k: usize,
        metric: Distance,
        nprobe: usize,
        filter: Option<&RowFilter>,
    ) -> CResult<Vec<Neighbor>> {
        let mut heap = ResultHeap::new(k);
        self.scan(store, query, metric, nprobe, filter, |row, distance| {
            heap.push(row, distance)
        })?;
        Ok(heap.into_sorted())
    }

    pub fn load(r: &mut dyn Read, dim: usize) -> CResult<Self> {
        let state: IvfPqState = bincode::deserialize_from(r)?;
        if state.dim as usize != dim {
            return Err(Error::Corrupted(format!(
                "ivfpq index dimension {} does not match database dimension {}",
                state.dim, dim
            )));
        }
        let mut index = Self::new(dim, state.metric, state.config)?;
        index.coarse = state.coarse;
        index.codebooks = state.codebooks;
        index.lists = state.lists;
        index.row_list = state.row_list;
        index.deleted = state.deleted.into_iter().collect();
        Ok(index)
    }
}

impl VectorIndex for IvfPqIndex {
    fn insert(&mut self, store: &VectorStore, row: u64) -> CResult<()> {
        if self.row_list.contains_key(&row) {
            return Err(Error::InvalidInput(format!("row {} already indexed", row)));
        }
        let vector = store.get(row)?.to_vec();
        self.encode_into_list(row, &vector)
    }

    fn remove(&mut self, row: u64) -> CResult<()> {
        if !self.row_list.contains_key(&row) || !self.deleted.insert(row) {
            return Err(Error::NotFound(format!("row {} not in index", row)));
        }
        Ok(())
    }

    fn update(&mut self, store: &VectorStore, row: u64) -> CResult<()> {
        let list = *self
            .row_list
            .get(&row)
            .ok_or_else(|| Error::NotFound(format!("row {} not in index", row)))?;
        self.lists[list].retain(|(r, _)| *r != row);
        self.row_list.remove(&row);
        let vector = store.get(row)?.to_vec();
        self.encode_into_list(row, &vector)
    }

    fn search(
        &self,
        store: &VectorStore,
        query: &[f32],
        k: usize,
        metric: Distance,
        filter: Option<&RowFilter>,
    ) -> CResult<Vec<Neighbor>> {
        self.search_with_nprobe(store, query, k, metric, self.config.nprobe, filter)
    }

    fn range_search(
        &self,
        store: &VectorStore,
        query: &[f32],
        radius: f32,
        metric: Distance,
        filter: Option<&RowFilter>,
    ) -> CResult<Vec<Neighbor>> {
        let mut out = Vec::new();
        self.scan(store, query, metric, self.config.nprobe, filter, |row, distance| {
            if distance <= radius {
                out.push(Neighbor { row, distance });
            }
        })?;
        out.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.row.cmp(&b.row)));
        Ok(out)
    }

    fn len(&self) -> usize {
        self.row_list.len() - self.deleted.len()
    }

    fn train(&mut self, vectors: &[Vec<f32>]) -> CResult<()> {
        if self.coarse.is_some() {
            return Err(Error::InvalidInput("index is already trained".into()));
        }
        if vectors.is_empty() {
            return Err(Error::InvalidInput("training set is empty".into()));
        }
        if vectors.iter().any(|v| v.len() != self.dim) {
            return Err(Error::InvalidInput("training vector dimension mismatch".into()));
        }
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let coarse = kmeans(vectors, self.dim, self.config.nlist, self.config.train_iters, &mut rng)?;

        // Codebooks are trained on residuals against the assigned centroid.
        let residuals: Vec<Vec<f32>> = vectors
            .iter()
            .map(|v| {
                let (list, _) = nearest_centroid(v, &coarse, self.dim);
                Self::residual(v, &coarse[list * self.dim..(list + 1) * self.dim])
            })
            .collect();
        let dsub = self.dim / self.config.m;
        let ksub = 1 << self.config.nbits;
        self.codebooks = Some(Codebooks::train(
            &residuals,
            self.config.m,
            dsub,
            ksub,
            self.config.train_iters,
            &mut rng,
        )?);
        self.coarse = Some(coarse);
        Ok(())
    }

    fn is_trained(&self) -> bool {
        self.coarse.is_some() && self.codebooks.is_some()
    }

    fn rebuild(&mut self, store: &VectorStore) -> CResult<()> {
        self.quantizers()?;
        for list in &mut self.lists {
            list.clear();
        }
        self.row_list.clear();
        self.deleted.clear();
        for row in store.live_indices() {
            let vector = store.get(row)?.to_vec();
            self.encode_into_list(row, &vector)?;
        }
        Ok(())
    }

    fn save(&self, w: &mut dyn Write) -> CResult<()> {
        let state = IvfPqState {
            dim: self.dim as u32,
            metric: self.metric,
            config: self.config.clone(),
            coarse: self.coarse.clone(),
            codebooks: self.codebooks.clone(),
            lists: self.lists.clone(),
            row_list: self.row_list.clone(),
            deleted: self.deleted.iter().copied().collect(),
        };
        bincode::serialize_into(w, &state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod pq_common {
        use super::*;

        crate::index::tests::test_index!(
            |training: &[Vec<f32>]| -> CResult<(VectorStore, PqIndex)> {
                let config = PqConfig { m: 2, nbits: 4, train_iters: 20, seed: 3 };
                let mut index = PqIndex::new(4, Distance::Euclidean, config)?;
                index.train(training)?;
                Ok((VectorStore::new(4)?, index))
            },
            |blob: &[u8], _store: &VectorStore| PqIndex::load(&mut &blob[..], 4)
        );
    }

    mod ivfpq_common {
        use super::*;

        crate::index::tests::test_index!(
            |training: &[Vec<f32>]| -> CResult<(VectorStore, IvfPqIndex)> {
                let config =
                    IvfPqConfig { nlist: 2, nprobe: 2, m: 2, nbits: 4, train_iters: 20, seed: 3 };
                let mut index = IvfPqIndex::new(4, Distance::Euclidean, config)?;
                index.train(training)?;
                Ok((VectorStore::new(4)?, index))
            },
            |blob: &[u8], _store: &VectorStore| IvfPqIndex::load(&mut &blob[..], 4)
        );
    }

    fn training_set(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect()).collect()
    }

    fn pq_config() -> PqConfig {
        PqConfig { m: 2, nbits: 4, train_iters: 10, seed: 3 }
    }

    fn ivf_config() -> IvfPqConfig {
        IvfPqConfig { nlist: 4, nprobe: 4, m: 2, nbits: 4, train_iters: 10, seed: 3 }
    }

    #[test]
    fn kmeans_centroid_count() -> CResult<()> {
        let points = training_set(64, 4, 1);
        let mut rng = StdRng::seed_from_u64(0);
        let centroids = kmeans(&points, 4, 8, 10, &mut rng)?;
        assert_eq!(centroids.len(), 32);
        Ok(())
    }

    #[test]
    fn kmeans_with_exactly_k_points() -> CResult<()> {
        let points = training_set(16, 4, 2);
        let mut rng = StdRng::seed_from_u64(0);
        let centroids = kmeans(&points, 4, 16, 10, &mut rng)?;
        assert_eq!(centroids.len(), 64);
        Ok(())
    }

    #[test]
    fn shape_validation() {
        assert!(PqIndex::new(7, Distance::Euclidean, pq_config()).is_err());
        assert!(PqIndex::new(8, Distance::Euclidean, PqConfig { nbits: 9, ..pq_config() }).is_err());
        let bad = IvfPqConfig { nprobe: 5, nlist: 4, ..ivf_config() };
        assert!(IvfPqIndex::new(8, Distance::Euclidean, bad).is_err());
    }

    #[test]
    fn untrained_rejected() -> CResult<()> {
        let mut store = VectorStore::new(4)?;
        let row = store.append(&[0.0; 4])?;
        let mut pq = PqIndex::new(4, Distance::Euclidean, pq_config())?;
        assert_eq!(pq.insert(&store, row), Err(Error::Untrained));
        assert_eq!(
            pq.search(&store, &[0.0; 4], 1, Distance::Euclidean, None),
            Err(Error::Untrained)
        );
        let mut ivf = IvfPqIndex::new(4, Distance::Euclidean, ivf_config())?;
        assert_eq!(ivf.insert(&store, row), Err(Error::Untrained));
        Ok(())
    }

    #[test]
    fn double_train_rejected() -> CResult<()> {
        let mut pq = PqIndex::new(4, Distance::Euclidean, pq_config())?;
        let set = training_set(64, 4, 4);
        pq.train(&set)?;
        assert!(pq.train(&set).is_err());
        Ok(())
    }

    #[test]
    fn pq_finds_near_neighbors() -> CResult<()> {
        let vectors = training_set(256, 4, 5);
        let mut store = VectorStore::new(4)?;
        let mut pq = PqIndex::new(4, Distance::Euclidean, pq_config())?;
        pq.train(&vectors)?;
        for v in &vectors {
            let row = store.append(v)?;
            pq.insert(&store, row)?;
        }
        // ADC is approximate; the true row must appear near the top.
        let hits = pq.search(&store, &vectors[100], 10, Distance::Euclidean, None)?;
        assert!(hits.iter().any(|n| n.row == 100), "row 100 missing from {:?}", hits);
        Ok(())
    }

    #[test]
    fn ivfpq_finds_near_neighbors() -> CResult<()> {
        let vectors = training_set(256, 4, 6);
        let mut store = VectorStore::new(4)?;
        let mut ivf = IvfPqIndex::new(4, Distance::Euclidean, ivf_config())?;
        ivf.train(&vectors)?;
        for v in &vectors {
            let row = store.append(v)?;
            ivf.insert(&store, row)?;
        }
        let hits = ivf.search(&store, &vectors[42], 10, Distance::Euclidean, None)?;
        assert!(hits.iter().any(|n| n.row == 42), "row 42 missing from {:?}", hits);
        assert_eq!(ivf.len(), 256);
        Ok(())
    }

    #[test]
    fn tombstoned_rows_suppressed() -> CResult<()> {
        let vectors = training_set(64, 4, 7);
        let mut store = VectorStore::new(4)?;
        let mut ivf = IvfPqIndex::new(4, Distance::Euclidean, ivf_config())?;
        ivf.train(&vectors)?;
        for v in &vectors {
            let row = store.append(v)?;
            ivf.insert(&store, row)?;
        }
        ivf.remove(7)?;
        let hits = ivf.search(&store, &vectors[7], 64, Distance::Euclidean, None)?;
        assert!(hits.iter().all(|n| n.row != 7));
        assert_eq!(ivf.len(), 63);
        assert!(matches!(ivf.remove(7), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn save_load_round_trip() -> CResult<()> {
        let vectors = training_set(128, 4, 8);
        let mut store = VectorStore::new(4)?;
        let mut ivf = IvfPqIndex::new(4, Distance::Euclidean, ivf_config())?;
        ivf.train(&vectors)?;
        for v in &vectors {
            let row = store.append(v)?;
            ivf.insert(&store, row)?;
        }
        let mut blob = Vec::new();
        ivf.save(&mut blob)?;
        let loaded = IvfPqIndex::load(&mut blob.as_slice(), 4)?;
        assert_eq!(loaded.len(), ivf.len());
        let a = ivf.search(&store, &vectors[12], 5, Distance::Euclidean, None)?;
        let b = loaded.search(&store, &vectors[12], 5, Distance::Euclidean, None)?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn update_relocates_row() -> CResult<()> {
        let vectors = training_set(64, 4, 9);
        let mut store = VectorStore::new(4)?;
        let mut ivf = IvfPqIndex::new(4, Distance::Euclidean, ivf_config())?;
        ivf.train(&vectors)?;
        for v in &vectors {
            let row = store.append(v)?;
            ivf.insert(&store, row)?;
        }
        store.update(11, &vectors[50].clone())?;
        ivf.update(&store, 11)?;
        let hits = ivf.search(&store, &vectors[50], 5, Distance::Euclidean, None)?;
        assert!(hits.iter().any(|n| n.row == 11));
        Ok(())
    }
}
