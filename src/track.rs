//! Arc/line rail tracks.
//!
//! An [`ArcLinTrack`] interprets an ordered list of 3D points as a smooth space curve.
//! Every vertex carries a local curve through its two neighbours: the circle through the
//! three points, or the two chords when the vertex is an end point, the points are
//! collinear, or the turn is sharper than [`MAX_ARC_TURN`]. Between two vertices the
//! curve blends their local curves linearly, so consecutive chord vertices produce an
//! exact straight segment and the curve is continuous in position and tangent.
//!
//! The curve is parameterized by its true arclength `s`. Each segment keeps a table of
//! arclength against blend parameter, integrated by Gauss-Legendre quadrature; lookups
//! interpolate the table and finish with Newton steps.

use crate::algebra::{Trf3, Vec3};
use crate::error::{KinematicsError, Result};
use na::{Matrix3, Vector3};
use std::f64::consts::FRAC_PI_3;

/// Vertices turning by more than this angle are treated as plain corners.
pub const MAX_ARC_TURN: f64 = FRAC_PI_3;

/// Relative cross-product magnitude below which three points are collinear.
const COLLINEAR_EPS: f64 = 1.0e-10;
/// Finite-difference step for frame rotation derivatives, relative to the segment span.
const FD_REL_STEP: f64 = 1.0e-3;
/// Samples per segment for the coarse nearest-point scan.
const COARSE_SAMPLES: usize = 8;
/// Newton iterations refining a nearest-point candidate.
const REFINE_ITERS: usize = 12;
/// Subintervals of the per-segment arclength table.
const ARC_TABLE_STEPS: usize = 16;
/// Newton iterations inverting the arclength table.
const ARC_INVERT_ITERS: usize = 6;

// Five-point Gauss-Legendre rule on [-1, 1].
const GAUSS_NODES: [f64; 5] = [
    0.0,
    -0.538_469_310_105_683,
    0.538_469_310_105_683,
    -0.906_179_845_938_664,
    0.906_179_845_938_664,
];
const GAUSS_WEIGHTS: [f64; 5] = [
    0.568_888_888_888_889,
    0.478_628_670_499_366,
    0.478_628_670_499_366,
    0.236_926_885_056_189,
    0.236_926_885_056_189,
];

#[derive(Copy, Clone, Debug)]
enum VertexCurve {
    Chord {
        back: Vector3<f64>,
        fwd: Vector3<f64>,
    },
    Arc {
        // Columns: outward radial, tangent, normal.
        frame: Matrix3<f64>,
        rad: f64,
        back_len: f64,
        fwd_len: f64,
    },
}

impl VertexCurve {
    fn fit(prev: Option<Vector3<f64>>, pt: Vector3<f64>, next: Option<Vector3<f64>>) -> Self {
        let (prev, next) = match (prev, next) {
            (Some(a), Some(b)) => (a, b),
            (None, Some(b)) => {
                return Self::Chord {
                    back: b - pt,
                    fwd: b - pt,
                }
            }
            (Some(a), None) => {
                return Self::Chord {
                    back: pt - a,
                    fwd: pt - a,
                }
            }
            (None, None) => {
                return Self::Chord {
                    back: Vector3::zeros(),
                    fwd: Vector3::zeros(),
                }
            }
        };

        let back = pt - prev;
        let fwd = next - pt;
        let turn_axis = back.cross(&fwd);
        let sin_scale = turn_axis.norm();
        let turn = sin_scale.atan2(back.dot(&fwd));
        if sin_scale <= COLLINEAR_EPS * back.norm() * fwd.norm() || turn > MAX_ARC_TURN {
            return Self::Chord { back, fwd };
        }

        // Circumcenter relative to `pt`.
        let a = -back;
        let b = fwd;
        let axb = a.cross(&b);
        let center = (axb.cross(&a) * b.norm_squared() + b.cross(&axb) * a.norm_squared())
            / (2.0 * axb.norm_squared());
        let rad = center.norm();
        let radial = -center / rad;
        let normal = turn_axis / sin_scale;
        let tangent = normal.cross(&radial);
        let frame = Matrix3::from_columns(&[radial, tangent, normal]);

        let angle = |q: Vector3<f64>| {
            let l = frame.tr_mul(&q);
            l.y.atan2(l.x + rad)
        };
        Self::Arc {
            frame,
            rad,
            back_len: -angle(a) * rad,
            fwd_len: angle(b) * rad,
        }
    }

    /// Position and three derivatives of the local curve at `u ∈ [-1, 1]`, relative to
    /// the vertex. `u = -1` is the previous vertex and `u = 1` the next one.
    fn eval(&self, u: f64) -> [Vector3<f64>; 4] {
        match *self {
            Self::Chord { back, fwd } => {
                let d = if u < 0.0 { back } else { fwd };
                [d * u, d, Vector3::zeros(), Vector3::zeros()]
            }
            Self::Arc {
                frame,
                rad,
                back_len,
                fwd_len,
            } => {
                let len = if u < 0.0 { back_len } else { fwd_len };
                let phi = u * len / rad;
                let (sn, cs) = phi.sin_cos();
                let k1 = len;
                let k2 = len * len / rad;
                let k3 = k2 * len / rad;
                [
                    frame * Vector3::new(rad * (cs - 1.0), rad * sn, 0.0),
                    frame * Vector3::new(-k1 * sn, k1 * cs, 0.0),
                    frame * Vector3::new(-k2 * cs, -k2 * sn, 0.0),
                    frame * Vector3::new(k3 * sn, -k3 * cs, 0.0),
                ]
            }
        }
    }
}

#[derive(Clone, Debug)]
struct TrackVertex {
    point: Vector3<f64>,
    curve: VertexCurve,
    s: f64,
    span: f64,
    // Arclength from this vertex at `t = k / ARC_TABLE_STEPS` of the outgoing segment.
    arc: Vec<f64>,
    lateral: Option<Vector3<f64>>,
}

impl TrackVertex {
    fn new(point: Vector3<f64>) -> Self {
        Self {
            point,
            curve: VertexCurve::Chord {
                back: Vector3::zeros(),
                fwd: Vector3::zeros(),
            },
            s: 0.0,
            span: 0.0,
            arc: vec![0.0],
            lateral: None,
        }
    }
}

/// A curve location: segment index and blend parameter.
#[derive(Copy, Clone, Debug)]
struct Loc {
    seg: usize,
    t: f64,
}

/// Position and arclength derivatives of the curve at some `s`.
#[derive(Copy, Clone, Debug)]
pub struct CurvePoint {
    /// The point on the centerline.
    pub point: Vector3<f64>,
    /// Unit tangent.
    pub tangent: Vector3<f64>,
    /// Second arclength derivative (the curvature vector).
    pub acc: Vector3<f64>,
    /// Third arclength derivative.
    pub jerk: Vector3<f64>,
}

/// A piecewise arc/line space curve, parameterized by `s`.
///
/// A track always holds at least two points. Closed tracks wrap `s` modulo
/// [`length`](Self::length); open tracks clamp it to `[0, length]`. All queries
/// return centerline quantities; the pipe radius is only applied by track joints.
#[derive(Clone, Debug)]
pub struct ArcLinTrack {
    vertices: Vec<TrackVertex>,
    closed: bool,
    pipe_radius: f64,
    length: f64,
}

impl ArcLinTrack {
    /// Builds a track from its points.
    ///
    /// # Errors
    /// [`KinematicsError::DegenerateTrack`] for fewer than two points and
    /// [`KinematicsError::NonFiniteTrackPoint`] for NaN or infinite coordinates.
    pub fn from_points(points: &[Vec3], closed: bool, pipe_diameter: f64) -> Result<Self> {
        let mut track = Self {
            vertices: Vec::new(),
            closed,
            pipe_radius: pipe_diameter / 2.0,
            length: 0.0,
        };
        track.set_track(points, closed, pipe_diameter)?;
        Ok(track)
    }

    /// Replaces all points. On error the track is left unchanged.
    pub fn set_track(&mut self, points: &[Vec3], closed: bool, pipe_diameter: f64) -> Result<()> {
        if points.len() < 2 {
            return Err(KinematicsError::DegenerateTrack {
                count: points.len(),
            });
        }
        if let Some(index) = points
            .iter()
            .position(|p| !p.coords.iter().all(|c| c.is_finite()))
        {
            return Err(KinematicsError::NonFiniteTrackPoint { index });
        }
        self.vertices = points.iter().map(|p| TrackVertex::new(p.coords)).collect();
        self.closed = closed;
        self.pipe_radius = pipe_diameter / 2.0;
        self.fit();
        Ok(())
    }

    /// Appends a point and refits the curve. Returns the point's index.
    pub fn add_point(&mut self, point: Vec3) -> Result<usize> {
        if !point.coords.iter().all(|c| c.is_finite()) {
            return Err(KinematicsError::NonFiniteTrackPoint {
                index: self.vertices.len(),
            });
        }
        self.vertices.push(TrackVertex::new(point.coords));
        self.fit();
        Ok(self.vertices.len() - 1)
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// Always `false`: a track has at least two points.
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// The `idx`-th input point.
    ///
    /// # Panics
    /// Panics if `idx >= self.len()`.
    pub fn vertex(&self, idx: usize) -> Vec3 {
        assert!(
            idx < self.vertices.len(),
            "track point index {idx} out of range (len {})",
            self.vertices.len()
        );
        Vec3::from(self.vertices[idx].point)
    }

    /// The `s` of the `idx`-th input point.
    ///
    /// # Panics
    /// Panics if `idx >= self.len()`.
    pub fn vertex_s(&self, idx: usize) -> f64 {
        self.vertices[idx].s
    }

    /// Whether the last point connects back to the first.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Opens or closes the track.
    pub fn set_closed(&mut self, closed: bool) {
        if closed != self.closed {
            self.closed = closed;
            self.fit();
        }
    }

    /// Radius of the rail pipe.
    pub fn pipe_radius(&self) -> f64 {
        self.pipe_radius
    }

    /// Sets the radius of the rail pipe.
    pub fn set_pipe_radius(&mut self, radius: f64) {
        self.pipe_radius = radius;
    }

    /// Total length of the curve.
    pub fn length(&self) -> f64 {
        self.length
    }

    /// Largest valid `s`; equal to [`Self::length`].
    pub fn max_s(&self) -> f64 {
        self.length
    }

    /// Arithmetic mean of the points (not weighted by length).
    pub fn calc_centroid(&self) -> Vec3 {
        let sum = self
            .vertices
            .iter()
            .fold(Vector3::zeros(), |acc, v| acc + v.point);
        Vec3::from(sum / self.vertices.len() as f64)
    }

    /// Moves every point by `offset`.
    pub fn translate(&mut self, offset: &Vec3) {
        for v in &mut self.vertices {
            v.point += offset.coords;
        }
        self.fit();
    }

    fn segment_count(&self) -> usize {
        if self.closed {
            self.vertices.len()
        } else {
            self.vertices.len() - 1
        }
    }

    fn next_index(&self, i: usize) -> usize {
        (i + 1) % self.vertices.len()
    }

    fn fit(&mut self) {
        let n = self.vertices.len();
        if n < 2 {
            self.length = 0.0;
            return;
        }
        for i in 0..n {
            let prev = match i {
                0 if self.closed => Some(self.vertices[n - 1].point),
                0 => None,
                _ => Some(self.vertices[i - 1].point),
            };
            let next = if i + 1 < n {
                Some(self.vertices[i + 1].point)
            } else if self.closed {
                Some(self.vertices[0].point)
            } else {
                None
            };
            self.vertices[i].curve = VertexCurve::fit(prev, self.vertices[i].point, next);
        }

        let count = self.segment_count();
        let tables: Vec<Vec<f64>> = (0..n)
            .map(|i| if i < count { self.arc_table(i) } else { vec![0.0] })
            .collect();
        let mut s = 0.0;
        for (v, arc) in self.vertices.iter_mut().zip(tables) {
            v.s = s;
            v.span = arc.last().copied().unwrap_or(0.0);
            v.arc = arc;
            s += v.span;
        }
        self.length = s;
    }

    fn speed_at(&self, seg: usize, t: f64) -> f64 {
        self.blend(Loc { seg, t })[1].norm()
    }

    fn arc_between(&self, seg: usize, t0: f64, t1: f64) -> f64 {
        let (mid, half) = ((t0 + t1) / 2.0, (t1 - t0) / 2.0);
        let sum: f64 = GAUSS_NODES
            .iter()
            .zip(&GAUSS_WEIGHTS)
            .map(|(x, w)| w * self.speed_at(seg, mid + half * x))
            .sum();
        sum * half
    }

    fn arc_table(&self, seg: usize) -> Vec<f64> {
        let dt = 1.0 / ARC_TABLE_STEPS as f64;
        let mut table = Vec::with_capacity(ARC_TABLE_STEPS + 1);
        let mut acc = 0.0;
        table.push(acc);
        for k in 0..ARC_TABLE_STEPS {
            acc += self.arc_between(seg, k as f64 * dt, (k + 1) as f64 * dt);
            table.push(acc);
        }
        table
    }

    /// Arclength from the start of segment `seg` to blend parameter `t`.
    fn arc_at(&self, seg: usize, t: f64) -> f64 {
        let table = &self.vertices[seg].arc;
        if table.len() < 2 {
            return 0.0;
        }
        let steps = table.len() - 1;
        let k = ((t * steps as f64).floor().max(0.0) as usize).min(steps - 1);
        table[k] + self.arc_between(seg, k as f64 / steps as f64, t)
    }

    /// Blend parameter at arclength `sigma` from the start of segment `seg`.
    ///
    /// Outside `[0, span]` the local curves are extrapolated.
    fn t_at(&self, seg: usize, sigma: f64) -> f64 {
        let v = &self.vertices[seg];
        if v.span <= 0.0 || v.arc.len() < 2 {
            return 0.0;
        }
        let steps = v.arc.len() - 1;
        let k = v
            .arc
            .partition_point(|a| *a <= sigma)
            .saturating_sub(1)
            .min(steps - 1);
        let (a0, a1) = (v.arc[k], v.arc[k + 1]);
        let frac = if a1 > a0 { (sigma - a0) / (a1 - a0) } else { 0.0 };
        let mut t = (k as f64 + frac) / steps as f64;
        for _ in 0..ARC_INVERT_ITERS {
            let speed = self.speed_at(seg, t);
            if speed <= f64::EPSILON {
                break;
            }
            let dt = (self.arc_at(seg, t) - sigma) / speed;
            t -= dt;
            if dt.abs() < 1.0e-15 {
                break;
            }
        }
        t
    }

    /// Maps `s` into the valid range: wrapped for closed tracks, clamped for open ones.
    pub fn normalize_s(&self, s: f64) -> f64 {
        if self.closed {
            if self.length <= 0.0 {
                return 0.0;
            }
            let r = s.rem_euclid(self.length);
            if r >= self.length {
                0.0
            } else {
                r
            }
        } else {
            s.clamp(0.0, self.length)
        }
    }

    // Open tracks extend the end segments past `[0, length]`.
    fn locate_unclamped(&self, s: f64) -> Loc {
        let s = if self.closed { self.normalize_s(s) } else { s };
        let count = self.segment_count();
        let seg = self
            .vertices
            .partition_point(|v| v.s <= s)
            .saturating_sub(1)
            .min(count - 1);
        let t = self.t_at(seg, s - self.vertices[seg].s);
        Loc { seg, t }
    }

    fn locate(&self, s: f64) -> Loc {
        self.locate_unclamped(self.normalize_s(s))
    }

    /// Position and three derivatives with respect to the blend parameter `t`.
    fn blend(&self, loc: Loc) -> [Vector3<f64>; 4] {
        let va = &self.vertices[loc.seg];
        let vb = &self.vertices[self.next_index(loc.seg)];
        let t = loc.t;
        let a = va.curve.eval(t);
        let b = vb.curve.eval(t - 1.0);
        let a0 = va.point + a[0];
        let b0 = vb.point + b[0];
        [
            a0 * (1.0 - t) + b0 * t,
            b0 - a0 + a[1] * (1.0 - t) + b[1] * t,
            (b[1] - a[1]) * 2.0 + a[2] * (1.0 - t) + b[2] * t,
            (b[2] - a[2]) * 3.0 + a[3] * (1.0 - t) + b[3] * t,
        ]
    }

    fn s_of(&self, loc: Loc) -> f64 {
        self.vertices[loc.seg].s + self.arc_at(loc.seg, loc.t)
    }

    /// Geometric quantities at `s`, with derivatives taken with respect to
    /// arclength.
    pub fn curve_point(&self, s: f64) -> CurvePoint {
        self.curve_point_at(self.locate(s))
    }

    fn curve_point_at(&self, loc: Loc) -> CurvePoint {
        let [p, p1, p2, p3] = self.blend(loc);
        let v = p1.norm();
        if v <= f64::EPSILON {
            return CurvePoint {
                point: p,
                tangent: Vector3::zeros(),
                acc: Vector3::zeros(),
                jerk: Vector3::zeros(),
            };
        }
        let tangent = p1 / v;
        let w = p2.dot(&tangent);
        let acc = (p2 - tangent * w) / (v * v);
        let dk_dt = (p3 - tangent * p3.dot(&tangent)) / (v * v)
            - (tangent * p2.dot(&acc) + acc * (3.0 * w)) / v;
        CurvePoint {
            point: p,
            tangent,
            acc,
            jerk: dk_dt / v,
        }
    }

    /// Point on the centerline at `s`.
    pub fn point_at(&self, s: f64) -> Vec3 {
        self.point_and_dir(s).0
    }

    /// Unit tangent at `s`.
    pub fn dir_at(&self, s: f64) -> Vec3 {
        self.point_and_dir(s).1
    }

    /// Point on the centerline and unit tangent at `s`.
    pub fn point_and_dir(&self, s: f64) -> (Vec3, Vec3) {
        let cp = self.curve_point(s);
        (
            Vec3::from_vector(cp.point, false),
            Vec3::from_vector(cp.tangent, true),
        )
    }

    /// Curvature vector and its arclength derivative at `s`.
    ///
    /// Both vanish on straight segments; they jump where an arc meets a chord.
    pub fn acc_and_jerk(&self, s: f64) -> (Vec3, Vec3) {
        let cp = self.curve_point(s);
        (
            Vec3::from_vector(cp.acc, true),
            Vec3::from_vector(cp.jerk, true),
        )
    }

    /// The rail normal at `s` and its derivative with respect to `s`.
    ///
    /// The normal is `tangent × lateral`, where `lateral` points towards the co-track
    /// (see [`Self::set_co_track`]) or, without one, is `up × tangent`.
    pub fn x_dir(&self, s: f64) -> (Vec3, Vec3) {
        let partials = self.frame_partials(s);
        (
            Vec3::from_vector(partials[0].rot.column(0).into_owned(), true),
            Vec3::from_vector(partials[1].rot.column(0).into_owned(), true),
        )
    }

    fn rotation_at(&self, loc: Loc) -> Matrix3<f64> {
        let [_, p1, _, _] = self.blend(loc);
        let tangent = p1.try_normalize(f64::EPSILON).unwrap_or_else(Vector3::y);
        let va = &self.vertices[loc.seg];
        let vb = &self.vertices[self.next_index(loc.seg)];
        let lateral = match (va.lateral, vb.lateral) {
            (Some(a), Some(b)) => a * (1.0 - loc.t) + b * loc.t,
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => Vector3::z().cross(&tangent),
        };
        let x = tangent
            .cross(&lateral)
            .try_normalize(1.0e-12)
            .or_else(|| tangent.cross(&Vector3::x()).try_normalize(1.0e-12))
            .unwrap_or_else(|| tangent.cross(&Vector3::y()).normalize());
        Matrix3::from_columns(&[x, tangent, x.cross(&tangent)])
    }

    /// The rail frame at `s`: x along the rail normal, y along the tangent, z = x × y.
    pub fn frame(&self, s: f64) -> Trf3 {
        let loc = self.locate(s);
        Trf3::new(self.rotation_at(loc), self.blend(loc)[0])
    }

    /// The rail frame at `s` and its first three derivatives with respect to `s`.
    ///
    /// The translation derivatives are exact. The rotation derivatives use central
    /// differences with a step proportional to the local segment span.
    pub fn frame_partials(&self, s: f64) -> [Trf3; 4] {
        let s = self.normalize_s(s);
        let loc = self.locate_unclamped(s);
        let span = self.vertices[loc.seg].span;
        let cp = self.curve_point_at(loc);

        let h = (FD_REL_STEP * span).max(1.0e-9);
        let r = |ds: f64| self.rotation_at(self.locate_unclamped(s + ds));
        let (m2, m1, r0, q1, q2) = (r(-2.0 * h), r(-h), r(0.0), r(h), r(2.0 * h));
        let r1 = (q1 - m1) / (2.0 * h);
        let r2 = (q1 - r0 * 2.0 + m1) / (h * h);
        let r3 = (q2 - q1 * 2.0 + m1 * 2.0 - m2) / (2.0 * h * h * h);

        [
            Trf3::new(r0, cp.point),
            Trf3::derivative(r1, cp.tangent),
            Trf3::derivative(r2, cp.acc),
            Trf3::derivative(r3, cp.jerk),
        ]
    }

    /// Nearest point of the curve to `p`. Returns `s` and the curve point.
    ///
    /// Scans every segment coarsely, then refines the best sample per segment with
    /// Newton steps on the squared distance. Ties go to the smallest `s`.
    pub fn find_point(&self, p: &Vec3) -> (f64, Vec3) {
        let full = [(0.0, self.length)];
        self.find_point_in_windows(&p.coords, &full)
            .unwrap_or_else(|| (0.0, self.vertex(0)))
    }

    /// Nearest point of the curve to `p` with `s` restricted to `[min_s, max_s]`.
    ///
    /// On a closed track `min_s > max_s` selects the range that wraps through `s = 0`.
    /// Returns `None` if the range misses the curve.
    pub fn find_point_in_range(&self, p: &Vec3, min_s: f64, max_s: f64) -> Option<(f64, Vec3)> {
        if self.closed && min_s > max_s {
            let lo = self.normalize_s(min_s);
            let hi = self.normalize_s(max_s);
            self.find_point_in_windows(&p.coords, &[(0.0, hi), (lo, self.length)])
        } else {
            let lo = min_s.max(0.0);
            let hi = max_s.min(self.length);
            if lo > hi {
                return None;
            }
            self.find_point_in_windows(&p.coords, &[(lo, hi)])
        }
    }

    fn find_point_in_windows(
        &self,
        p: &Vector3<f64>,
        windows: &[(f64, f64)],
    ) -> Option<(f64, Vec3)> {
        let mut best: Option<(f64, f64, Vector3<f64>)> = None;
        for seg in 0..self.segment_count() {
            let v = &self.vertices[seg];
            for &(lo, hi) in windows {
                let (t_lo, t_hi) = if v.span > 0.0 {
                    if hi < v.s || lo > v.s + v.span {
                        continue;
                    }
                    let t_lo = if lo <= v.s {
                        0.0
                    } else {
                        self.t_at(seg, lo - v.s).clamp(0.0, 1.0)
                    };
                    let t_hi = if hi >= v.s + v.span {
                        1.0
                    } else {
                        self.t_at(seg, hi - v.s).clamp(0.0, 1.0)
                    };
                    (t_lo, t_hi)
                } else if lo <= v.s && v.s <= hi {
                    (0.0, 0.0)
                } else {
                    continue;
                };
                if t_lo > t_hi {
                    continue;
                }
                let t = self.nearest_on_segment(seg, p, t_lo, t_hi);
                let loc = Loc { seg, t };
                let q = self.blend(loc)[0];
                let dist = (q - p).norm();
                let s = self.normalize_s(self.s_of(loc));
                let better = match best {
                    None => true,
                    Some((bd, bs, _)) => dist < bd - 1.0e-12 || (dist <= bd + 1.0e-12 && s < bs),
                };
                if better {
                    best = Some((dist, s, q));
                }
            }
        }
        best.map(|(_, s, q)| (s, Vec3::from(q)))
    }

    fn nearest_on_segment(&self, seg: usize, p: &Vector3<f64>, t_lo: f64, t_hi: f64) -> f64 {
        let dist_sq = |t: f64| (self.blend(Loc { seg, t })[0] - p).norm_squared();
        let mut t = t_lo;
        let mut best = dist_sq(t_lo);
        for k in 1..=COARSE_SAMPLES {
            let tk = t_lo + (t_hi - t_lo) * k as f64 / COARSE_SAMPLES as f64;
            let d = dist_sq(tk);
            if d < best {
                best = d;
                t = tk;
            }
        }
        for _ in 0..REFINE_ITERS {
            let [q, q1, q2, _] = self.blend(Loc { seg, t });
            let diff = q - p;
            let f = diff.dot(&q1);
            let df = q1.norm_squared() + diff.dot(&q2);
            if df <= f64::EPSILON {
                break;
            }
            let next = (t - f / df).clamp(t_lo, t_hi);
            if (next - t).abs() < 1.0e-14 {
                break;
            }
            t = next;
        }
        t
    }

    /// Pairs this track with a parallel one, such as the other rail of a gauge.
    ///
    /// Every point of this track is projected onto `other`, and the rail normal is
    /// oriented from the projections. Between consecutive points the
    /// advance in `s` on both tracks must agree within `max_s_diff`. `reverse_dir` states that
    /// `other` runs the opposite way. On error nothing is changed.
    pub fn set_co_track(
        &mut self,
        other: &ArcLinTrack,
        reverse_dir: bool,
        max_s_diff: f64,
    ) -> Result<()> {
        let mut laterals = Vec::with_capacity(self.vertices.len());
        let mut prev: Option<(f64, f64)> = None;
        for (index, v) in self.vertices.iter().enumerate() {
            let (s_other, foot) = other.find_point(&Vec3::from(v.point));
            if let Some((s_prev, s_other_prev)) = prev {
                let advance = v.s - s_prev;
                let mut advance_other = s_other - s_other_prev;
                if other.closed {
                    let half = other.length / 2.0;
                    if advance_other > half {
                        advance_other -= other.length;
                    } else if advance_other < -half {
                        advance_other += other.length;
                    }
                }
                let expected = if reverse_dir { -advance } else { advance };
                let drift = (advance_other - expected).abs();
                if drift > max_s_diff {
                    log::warn!("co-track drift {drift:e} at point {index} exceeds {max_s_diff:e}");
                    return Err(KinematicsError::CoTrackMismatch {
                        index,
                        drift,
                        max: max_s_diff,
                    });
                }
            }
            laterals.push((foot.coords - v.point).try_normalize(f64::EPSILON));
            prev = Some((v.s, s_other));
        }
        for (v, lateral) in self.vertices.iter_mut().zip(laterals) {
            v.lateral = lateral;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use std::f64::consts::PI;

    fn pts(list: &[[f64; 3]]) -> Vec<Vec3> {
        list.iter().map(|p| Vec3::new(p[0], p[1], p[2])).collect()
    }

    fn polygon(n: usize, radius: f64) -> Vec<Vec3> {
        (0..n)
            .map(|i| {
                let a = 2.0 * PI * i as f64 / n as f64;
                Vec3::new(radius * a.cos(), radius * a.sin(), 0.0)
            })
            .collect()
    }

    #[test]
    fn rejects_degenerate_input() {
        assert_eq!(
            ArcLinTrack::from_points(&pts(&[[0.0, 0.0, 0.0]]), false, 0.0).unwrap_err(),
            KinematicsError::DegenerateTrack { count: 1 }
        );
        assert_eq!(
            ArcLinTrack::from_points(&pts(&[[0.0, 0.0, 0.0], [f64::NAN, 0.0, 0.0]]), false, 0.0)
                .unwrap_err(),
            KinematicsError::NonFiniteTrackPoint { index: 1 }
        );
    }

    #[test]
    fn corner_is_continuous_and_projects() {
        let corner = pts(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0]]);
        let track = ArcLinTrack::from_points(&corner, false, 0.1).unwrap();
        assert_relative_eq!(track.length(), 2.0, epsilon = 1.0e-12);
        assert_relative_eq!(track.pipe_radius(), 0.05);

        let (before, _) = track.point_and_dir(1.0 - 1.0e-9);
        let (at, _) = track.point_and_dir(1.0);
        let (after, _) = track.point_and_dir(1.0 + 1.0e-9);
        assert!(before.dist_to(&at) < 1.0e-8);
        assert!(after.dist_to(&at) < 1.0e-8);
        assert_eq!(at, Vec3::new(1.0, 0.0, 0.0));

        let (_, dir) = track.point_and_dir(1.5);
        assert_eq!(dir, Vec3::new(0.0, 1.0, 0.0));

        let (s, q) = track.find_point(&Vec3::new(1.0, 0.5, 0.0));
        assert_relative_eq!(s, 1.5, epsilon = 1.0e-9);
        assert!(q.dist_to(&Vec3::new(1.0, 0.5, 0.0)) < 1.0e-9);
    }

    #[test]
    fn closed_square_wraps() {
        let track = ArcLinTrack::from_points(
            &pts(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]]),
            true,
            0.0,
        )
        .unwrap();
        let len = track.length();
        assert_relative_eq!(len, 4.0, epsilon = 1.0e-12);
        let (p0, d0) = track.point_and_dir(0.1);
        let (p1, d1) = track.point_and_dir(len + 0.1);
        assert_eq!(p0, p1);
        assert_eq!(d0, d1);
        let (p2, _) = track.point_and_dir(0.1 - len);
        assert_eq!(p0, p2);
        assert_eq!(track.calc_centroid(), Vec3::new(0.5, 0.5, 0.0));
    }

    #[test]
    fn open_track_clamps() {
        let line = pts(&[[0.0, 0.0, 0.0], [2.0, 0.0, 0.0]]);
        let track = ArcLinTrack::from_points(&line, false, 0.0).unwrap();
        assert_eq!(track.point_and_dir(-1.0).0, Vec3::new(0.0, 0.0, 0.0));
        assert_eq!(track.point_and_dir(5.0).0, Vec3::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn polygon_fits_its_circle() {
        let radius = 3.0;
        let track = ArcLinTrack::from_points(&polygon(24, radius), true, 0.0).unwrap();
        // Arc vertices reproduce the circle, so the length is the circumference.
        assert_relative_eq!(track.length(), 2.0 * PI * radius, max_relative = 1.0e-9);
        for k in 0..50 {
            let s = track.length() * k as f64 / 50.0;
            let cp = track.curve_point(s);
            assert_relative_eq!(cp.point.norm(), radius, epsilon = 1.0e-9);
            assert_abs_diff_eq!(cp.tangent.dot(&cp.point), 0.0, epsilon = 1.0e-9);
            // Curvature vector points at the center with magnitude 1/r.
            assert_relative_eq!(cp.acc, -cp.point / (radius * radius), epsilon = 1.0e-7);
            assert_relative_eq!(cp.jerk, -cp.tangent / (radius * radius), epsilon = 1.0e-7);
        }
    }

    #[test]
    fn frame_partials_match_differences() {
        let track = ArcLinTrack::from_points(&polygon(16, 2.0), true, 0.0).unwrap();
        let s = 1.234;
        let h = 1.0e-5;
        let [f, f1, _, _] = track.frame_partials(s);
        let (fp, fm) = (track.frame(s + h), track.frame(s - h));
        assert!(f.relative_eq(&track.frame(s), 1.0e-12));
        assert_relative_eq!(f1.trans, (fp.trans - fm.trans) / (2.0 * h), epsilon = 1.0e-6);
        assert_relative_eq!(f1.rot, (fp.rot - fm.rot) / (2.0 * h), epsilon = 1.0e-5);
        // Orthonormal, right-handed, y along the tangent.
        assert_relative_eq!(f.rot.determinant(), 1.0, epsilon = 1.0e-12);
        let (_, dir) = track.point_and_dir(s);
        assert_relative_eq!(f.rot.column(1).into_owned(), dir.coords, epsilon = 1.0e-12);
        // Without a co-track the rail normal points up.
        let (x, _) = track.x_dir(s);
        assert_relative_eq!(x.coords, Vector3::z(), epsilon = 1.0e-12);
    }

    #[test]
    fn mixed_arcs_and_chords_follow_arclength() {
        let bump = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [2.0, 0.3, 0.0],
            [3.0, 0.3, 0.0],
            [4.0, 0.0, 0.0],
            [5.0, 0.0, 0.0],
        ];
        let track = ArcLinTrack::from_points(&pts(&bump), false, 0.0).unwrap();
        let len = track.length();

        // Unit speed everywhere, including across the arc/chord transitions.
        let h = 1.0e-5;
        for k in 1..200 {
            let s = len * k as f64 / 200.0;
            let d = (track.point_at(s + h) - track.point_at(s - h)) / (2.0 * h);
            assert_relative_eq!(d.len(), 1.0, epsilon = 1.0e-6);
        }

        // The parameter range is the length of the traced curve.
        let samples = 20_000;
        let traced: f64 = (0..samples)
            .map(|k| {
                let a = track.point_at(len * k as f64 / samples as f64);
                let b = track.point_at(len * (k + 1) as f64 / samples as f64);
                a.dist_to(&b)
            })
            .sum();
        assert_relative_eq!(track.max_s(), traced, max_relative = 1.0e-7);

        for i in 0..track.len() {
            assert!(track.point_at(track.vertex_s(i)).dist_to(&track.vertex(i)) < 1.0e-9);
        }
    }

    #[test]
    fn nearest_point_ties_go_to_the_smallest_s() {
        let corner = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0]];
        let track = ArcLinTrack::from_points(&pts(&corner), false, 0.0).unwrap();
        // Half a unit from both legs: s = 0.5 on the first, s = 1.5 on the second.
        let (s, q) = track.find_point(&Vec3::new(0.5, 0.5, 0.0));
        assert_relative_eq!(s, 0.5, epsilon = 1.0e-9);
        assert_eq!(q, Vec3::new(0.5, 0.0, 0.0));

        let square = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]];
        let track = ArcLinTrack::from_points(&pts(&square), true, 0.0).unwrap();
        let (s, _) = track.find_point(&Vec3::new(0.5, 0.5, 0.0));
        assert_relative_eq!(s, 0.5, epsilon = 1.0e-9);
        let (s, _) = track.find_point_in_range(&Vec3::new(0.5, 0.5, 0.0), 1.0, 4.0).unwrap();
        assert_relative_eq!(s, 1.5, epsilon = 1.0e-9);
    }

    #[test]
    fn find_point_in_range_respects_bounds() {
        let track = ArcLinTrack::from_points(
            &pts(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 1.0, 0.0]]),
            true,
            0.0,
        )
        .unwrap();
        let p = Vec3::new(0.5, -0.2, 0.0);
        let (s, _) = track.find_point(&p);
        assert_relative_eq!(s, 0.5, epsilon = 1.0e-9);
        let (s, q) = track.find_point_in_range(&p, 1.0, 3.0).unwrap();
        assert_relative_eq!(s, 1.0, epsilon = 1.0e-9);
        assert_eq!(q, Vec3::new(1.0, 0.0, 0.0));
        // The wrapping window [3.5, 0.25] reaches s = 0.25 from below.
        let (s, _) = track.find_point_in_range(&p, 3.5, 0.25).unwrap();
        assert_relative_eq!(s, 0.25, epsilon = 1.0e-9);
    }

    #[test]
    fn co_track_orients_normal_and_checks_drift() {
        let left = pts(&[[0.0, 0.0, 0.0], [0.0, 5.0, 0.0], [0.0, 10.0, 0.0]]);
        let right = pts(&[[1.0, 0.0, 0.0], [1.0, 5.0, 0.0], [1.0, 10.0, 0.0]]);
        let mut track = ArcLinTrack::from_points(&left, false, 0.0).unwrap();
        let co = ArcLinTrack::from_points(&right, false, 0.0).unwrap();
        track.set_co_track(&co, false, 0.01).unwrap();
        // tangent +y, lateral +x, normal = y × x = -z
        let (x, _) = track.x_dir(2.0);
        assert_relative_eq!(x.coords, -Vector3::z(), epsilon = 1.0e-12);

        // A bent co-track: its projection of (0,5,0) lands far from s = 5.
        let bent = pts(&[[1.0, 0.0, 0.0], [4.0, 5.0, 0.0], [1.0, 10.0, 0.0]]);
        let co = ArcLinTrack::from_points(&bent, false, 0.0).unwrap();
        let mut other = ArcLinTrack::from_points(&left, false, 0.0).unwrap();
        let err = other.set_co_track(&co, false, 0.5).unwrap_err();
        assert!(matches!(err, KinematicsError::CoTrackMismatch { index: 1, .. }));

        let reversed: Vec<Vec3> = right.iter().rev().copied().collect();
        let co = ArcLinTrack::from_points(&reversed, false, 0.0).unwrap();
        assert!(other.set_co_track(&co, false, 0.5).is_err());
        other.set_co_track(&co, true, 0.5).unwrap();
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn vertex_index_out_of_range_panics() {
        let line = pts(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]]);
        let track = ArcLinTrack::from_points(&line, false, 0.0).unwrap();
        let _ = track.vertex(2);
    }
}
