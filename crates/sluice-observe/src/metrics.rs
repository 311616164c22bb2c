//! Metric registry and Prometheus text exposition.
//!
//! Metrics are declared once per [`Registry`] with a name and a list
//! of label names; [`Counter::with_labels`] and friends return handles
//! bound to concrete label values, created on first touch. Exposition
//! follows the Prometheus text format: one `name{labels} value` line
//! per instance, with histogram buckets as cumulative `le` lines.
//! Numbers render in Rust's shortest round-trip form, so any double
//! survives a scrape.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

/// The value store behind one metric family.
enum Slots {
    Scalar(RefCell<Vec<(Vec<Rc<str>>, f64)>>),
    Histogram {
        boundaries: Vec<f64>,
        /// Per instance: non-cumulative bucket counts.
        counts: RefCell<Vec<(Vec<Rc<str>>, Vec<u64>)>>,
    },
}

struct Family {
    name: Rc<str>,
    label_names: Vec<Rc<str>>,
    slots: Slots,
}

impl Family {
    fn scalar_slot(&self, labels: &[Rc<str>], create: bool) -> Option<usize> {
        let Slots::Scalar(slots) = &self.slots else {
            return None;
        };
        let found = slots.borrow().iter().position(|(l, _)| l == labels);
        match (found, create) {
            (Some(i), _) => Some(i),
            (None, true) => {
                let mut slots = slots.borrow_mut();
                slots.push((labels.to_vec(), 0.0));
                Some(slots.len() - 1)
            }
            (None, false) => None,
        }
    }

    fn update_scalar(&self, labels: &[Rc<str>], f: impl FnOnce(f64) -> f64) {
        if let Some(i) = self.scalar_slot(labels, true) {
            if let Slots::Scalar(slots) = &self.slots {
                let mut slots = slots.borrow_mut();
                let value = slots[i].1;
                slots[i].1 = f(value);
            }
        }
    }

    fn scalar_value(&self, labels: &[Rc<str>]) -> Option<f64> {
        let Slots::Scalar(slots) = &self.slots else {
            return None;
        };
        slots
            .borrow()
            .iter()
            .find(|(l, _)| l == labels)
            .map(|(_, v)| *v)
    }

    fn observe(&self, labels: &[Rc<str>], value: f64) {
        let Slots::Histogram { boundaries, counts } = &self.slots else {
            return;
        };
        let mut counts = counts.borrow_mut();
        let slot = match counts.iter().position(|(l, _)| l == labels) {
            Some(i) => &mut counts[i].1,
            None => {
                counts.push((labels.to_vec(), vec![0; boundaries.len()]));
                let last = counts.len() - 1;
                &mut counts[last].1
            }
        };
        if let Some(i) = boundaries.iter().position(|b| value <= *b) {
            slot[i] += 1;
        }
        // Observations above the last boundary are not bucketed; the
        // original exposes boundary buckets only, with no +Inf line.
    }
}

/// Renders a float in shortest round-trip form (`3` not `3.0`).
fn format_number(value: f64) -> String {
    format!("{value}")
}

fn write_line(out: &mut String, name: &str, labels: &[(&str, &str)], value: f64) {
    out.push_str(name);
    if !labels.is_empty() {
        out.push('{');
        for (i, (k, v)) in labels.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{k}=\"{v}\"");
        }
        out.push('}');
    }
    let _ = writeln!(out, " {}", format_number(value));
}

/// A per-worker collection of metric families, serialized in
/// registration order.
#[derive(Clone, Default)]
pub struct Registry {
    families: Rc<RefCell<Vec<Rc<Family>>>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, family: Family) -> Rc<Family> {
        let family = Rc::new(family);
        self.families.borrow_mut().push(Rc::clone(&family));
        family
    }

    /// Declares a counter family.
    #[must_use]
    pub fn counter(&self, name: &str, label_names: &[&str]) -> Counter {
        Counter {
            family: self.register(Family {
                name: Rc::from(name),
                label_names: label_names.iter().map(|n| Rc::from(*n)).collect(),
                slots: Slots::Scalar(RefCell::new(Vec::new())),
            }),
            labels: Vec::new(),
        }
    }

    /// Declares a gauge family.
    #[must_use]
    pub fn gauge(&self, name: &str, label_names: &[&str]) -> Gauge {
        Gauge {
            family: self.register(Family {
                name: Rc::from(name),
                label_names: label_names.iter().map(|n| Rc::from(*n)).collect(),
                slots: Slots::Scalar(RefCell::new(Vec::new())),
            }),
            labels: Vec::new(),
        }
    }

    /// Declares a histogram family over `boundaries`.
    #[must_use]
    pub fn histogram(&self, name: &str, boundaries: Vec<f64>, label_names: &[&str]) -> Histogram {
        Histogram {
            family: self.register(Family {
                name: Rc::from(name),
                label_names: label_names.iter().map(|n| Rc::from(*n)).collect(),
                slots: Slots::Histogram {
                    boundaries,
                    counts: RefCell::new(Vec::new()),
                },
            }),
            labels: Vec::new(),
        }
    }

    /// Serializes every touched instance to Prometheus text format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        for family in self.families.borrow().iter() {
            match &family.slots {
                Slots::Scalar(slots) => {
                    for (labels, value) in slots.borrow().iter() {
                        let pairs: Vec<(&str, &str)> = family
                            .label_names
                            .iter()
                            .zip(labels)
                            .map(|(k, v)| (&**k, &**v))
                            .collect();
                        write_line(&mut out, &family.name, &pairs, *value);
                    }
                }
                Slots::Histogram { boundaries, counts } => {
                    for (labels, buckets) in counts.borrow().iter() {
                        let mut cumulative = 0u64;
                        for (boundary, count) in boundaries.iter().zip(buckets) {
                            cumulative += count;
                            let le = format_number(*boundary);
                            let mut pairs: Vec<(&str, &str)> = family
                                .label_names
                                .iter()
                                .zip(labels)
                                .map(|(k, v)| (&**k, &**v))
                                .collect();
                            pairs.push(("le", le.as_str()));
                            #[allow(clippy::cast_precision_loss)]
                            write_line(&mut out, &family.name, &pairs, cumulative as f64);
                        }
                    }
                }
            }
        }
        out
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Registry({} families)", self.families.borrow().len())
    }
}

/// Monotonically increasing metric.
#[derive(Clone)]
pub struct Counter {
    family: Rc<Family>,
    labels: Vec<Rc<str>>,
}

impl Counter {
    /// A handle bound to concrete label values.
    #[must_use]
    pub fn with_labels(&self, values: &[&str]) -> Counter {
        Counter {
            family: Rc::clone(&self.family),
            labels: values.iter().map(|v| Rc::from(*v)).collect(),
        }
    }

    /// Creates the instance at zero.
    pub fn zero(&self) {
        self.family.update_scalar(&self.labels, |_| 0.0);
    }

    /// Adds `n`.
    pub fn increase(&self, n: f64) {
        self.family.update_scalar(&self.labels, |v| v + n);
    }

    /// Current value; zero if never touched.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.family.scalar_value(&self.labels).unwrap_or(0.0)
    }
}

/// Up-and-down metric.
#[derive(Clone)]
pub struct Gauge {
    family: Rc<Family>,
    labels: Vec<Rc<str>>,
}

impl Gauge {
    /// A handle bound to concrete label values.
    #[must_use]
    pub fn with_labels(&self, values: &[&str]) -> Gauge {
        Gauge {
            family: Rc::clone(&self.family),
            labels: values.iter().map(|v| Rc::from(*v)).collect(),
        }
    }

    /// Creates the instance at zero.
    pub fn zero(&self) {
        self.family.update_scalar(&self.labels, |_| 0.0);
    }

    /// Sets the value.
    pub fn set(&self, n: f64) {
        self.family.update_scalar(&self.labels, |_| n);
    }

    /// Adds `n`.
    pub fn increase(&self, n: f64) {
        self.family.update_scalar(&self.labels, |v| v + n);
    }

    /// Subtracts `n`.
    pub fn decrease(&self, n: f64) {
        self.family.update_scalar(&self.labels, |v| v - n);
    }

    /// Current value; zero if never touched.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.family.scalar_value(&self.labels).unwrap_or(0.0)
    }
}

/// Bucketed distribution metric.
#[derive(Clone)]
pub struct Histogram {
    family: Rc<Family>,
    labels: Vec<Rc<str>>,
}

impl Histogram {
    /// A handle bound to concrete label values.
    #[must_use]
    pub fn with_labels(&self, values: &[&str]) -> Histogram {
        Histogram {
            family: Rc::clone(&self.family),
            labels: values.iter().map(|v| Rc::from(*v)).collect(),
        }
    }

    /// Records one observation.
    pub fn observe(&self, value: f64) {
        self.family.observe(&self.labels, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_line() {
        let registry = Registry::new();
        let reqs = registry.counter("reqs", &["method"]);
        reqs.with_labels(&["GET"]).increase(3.0);
        let out = registry.to_prometheus();
        assert!(out.contains("reqs{method=\"GET\"} 3\n"), "got: {out}");
    }

    #[test]
    fn test_gauge_line() {
        let registry = Registry::new();
        let q = registry.gauge("q", &[]);
        q.set(0.5);
        assert!(registry.to_prometheus().contains("q 0.5\n"));
    }

    #[test]
    fn test_histogram_cumulative_buckets() {
        let registry = Registry::new();
        let lat = registry.histogram("lat", vec![1.0, 10.0, 100.0], &[]);
        lat.observe(0.5);
        lat.observe(5.0);
        lat.observe(50.0);
        let out = registry.to_prometheus();
        assert!(out.contains("lat{le=\"1\"} 1\n"), "got: {out}");
        assert!(out.contains("lat{le=\"10\"} 2\n"), "got: {out}");
        assert!(out.contains("lat{le=\"100\"} 3\n"), "got: {out}");
    }

    #[test]
    fn test_prometheus_scrape_scenario() {
        let registry = Registry::new();
        let reqs = registry.counter("reqs", &["method"]);
        reqs.with_labels(&["GET"]).increase(3.0);
        let q = registry.gauge("q", &[]);
        q.set(0.5);
        let lat = registry.histogram("lat", vec![1.0, 10.0, 100.0], &[]);
        for v in [0.5, 5.0, 50.0] {
            lat.observe(v);
        }

        let out = registry.to_prometheus();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines,
            vec![
                "reqs{method=\"GET\"} 3",
                "q 0.5",
                "lat{le=\"1\"} 1",
                "lat{le=\"10\"} 2",
                "lat{le=\"100\"} 3",
            ]
        );
    }

    #[test]
    fn test_labeled_histogram_includes_parent_labels() {
        let registry = Registry::new();
        let lat = registry.histogram("lat", vec![1.0], &["route"]);
        lat.with_labels(&["/a"]).observe(0.5);
        let out = registry.to_prometheus();
        assert!(out.contains("lat{route=\"/a\",le=\"1\"} 1\n"), "got: {out}");
    }

    #[test]
    fn test_untouched_metric_emits_nothing() {
        let registry = Registry::new();
        let _c = registry.counter("silent", &[]);
        assert_eq!(registry.to_prometheus(), "");
    }

    #[test]
    fn test_zero_creates_instance() {
        let registry = Registry::new();
        let c = registry.counter("zeroed", &[]);
        c.zero();
        assert!(registry.to_prometheus().contains("zeroed 0\n"));
    }

    #[test]
    fn test_number_formatting_round_trips() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(0.5), "0.5");
        let tricky = 0.1 + 0.2;
        let rendered = format_number(tricky);
        let parsed: f64 = rendered.parse().unwrap();
        assert_eq!(parsed, tricky, "shortest form must round-trip");
    }

    #[test]
    fn test_counter_instances_are_separate() {
        let registry = Registry::new();
        let reqs = registry.counter("reqs", &["method"]);
        reqs.with_labels(&["GET"]).increase(1.0);
        reqs.with_labels(&["POST"]).increase(2.0);
        assert_eq!(reqs.with_labels(&["GET"]).value(), 1.0);
        assert_eq!(reqs.with_labels(&["POST"]).value(), 2.0);
    }
}
