//! A reader for the Prometheus text exposition format served on a controller pod's `/metrics`.

use e2e_model::LabelSet;

/// One sample line of an exposition.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpositionSample {
    pub name: String,
    pub labels: LabelSet,
    pub value: f64,
}

/// Parses every sample line of `text`. Comments, blank lines and lines whose labels cannot be
/// read are skipped. A value that is not a finite number is read as 0.
pub fn parse(text: &str) -> Vec<ExpositionSample> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(parse_line)
        .collect()
}

/// The sum of the samples of `metric` that carry every label of `labels` with exactly the given
/// value.
pub fn counter_value(samples: &[ExpositionSample], metric: &str, labels: &LabelSet) -> f64 {
    samples
        .iter()
        .filter(|sample| sample.name == metric && labels.matches(sample.labels.iter()))
        .fold(0.0, |sum, sample| sum + sample.value)
}

/// The sum of all samples of `metric`.
pub fn gauge_sum(samples: &[ExpositionSample], metric: &str) -> f64 {
    samples
        .iter()
        .filter(|sample| sample.name == metric)
        .fold(0.0, |sum, sample| sum + sample.value)
}

/// `true` if at least one sample of `metric` was exposed.
pub fn has_family(samples: &[ExpositionSample], metric: &str) -> bool {
    samples.iter().any(|sample| sample.name == metric)
}

fn parse_line(line: &str) -> Option<ExpositionSample> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .unwrap_or(line.len());
    let name = &line[..name_end];
    if name.is_empty() {
        return None;
    }
    let mut rest = &line[name_end..];
    let mut labels = LabelSet::new();
    if let Some(body) = rest.strip_prefix('{') {
        let (parsed, after) = parse_labels(body)?;
        labels = parsed;
        rest = after;
    }
    let value = rest
        .split_whitespace()
        .next()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(0.0);
    Some(ExpositionSample {
        name: name.to_string(),
        labels,
        value,
    })
}

// Reads `a="x",b="y"}` and returns the labels with whatever follows the closing brace.
fn parse_labels(body: &str) -> Option<(LabelSet, &str)> {
    let mut labels = LabelSet::new();
    let mut chars = body.char_indices().peekable();
    loop {
        while let Some((_, c)) = chars.peek() {
            if *c == ',' || c.is_whitespace() {
                chars.next();
            } else {
                break;
            }
        }
        let (start, c) = chars.next()?;
        if c == '}' {
            return Some((labels, &body[start + 1..]));
        }
        let name_end = loop {
            let (i, c) = chars.next()?;
            if c == '=' {
                break i;
            }
        };
        let name = body[start..name_end].trim();
        if chars.next()?.1 != '"' {
            return None;
        }
        let mut value = String::new();
        loop {
            match chars.next()? {
                (_, '\\') => match chars.next()?.1 {
                    'n' => value.push('\n'),
                    other => value.push(other),
                },
                (_, '"') => break,
                (_, other) => value.push(other),
            }
        }
        labels = labels.with(name, value);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use e2e_model::Operation;

    const SCRAPE: &str = r#"
# HELP kapparmor_profile_operations_total Profile operations by type.
# TYPE kapparmor_profile_operations_total counter
kapparmor_profile_operations_total{operation="create",profile_name="custom.a"} 2
kapparmor_profile_operations_total{operation="delete",profile_name="custom.a"} 1
kapparmor_profile_operations_total{operation="create",profile_name="custom.ab"} 5
# HELP kapparmor_profiles_managed Managed profiles.
# TYPE kapparmor_profiles_managed gauge
kapparmor_profiles_managed 3
go_goroutines 12
"#;

    #[test]
    fn counter_requires_exact_labels() {
        let samples = parse(SCRAPE);
        assert_eq!(samples.len(), 5);
        let labels = LabelSet::operation(Operation::Create, "custom.a");
        assert_eq!(
            counter_value(&samples, "kapparmor_profile_operations_total", &labels),
            2.0
        );
        let missing = LabelSet::operation(Operation::Modify, "custom.a");
        assert_eq!(
            counter_value(&samples, "kapparmor_profile_operations_total", &missing),
            0.0
        );
        assert_eq!(gauge_sum(&samples, "kapparmor_profiles_managed"), 3.0);
        assert!(has_family(&samples, "go_goroutines"));
        assert!(!has_family(&samples, "kapparmor_profiles"));
    }

    #[test]
    fn escaped_label_values() {
        let samples = parse(r#"m{path="a\"b\\c",note="x\ny", empty=""} 1 1700000000000"#);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].labels.get("path"), Some("a\"b\\c"));
        assert_eq!(samples[0].labels.get("note"), Some("x\ny"));
        assert_eq!(samples[0].labels.get("empty"), Some(""));
        assert_eq!(samples[0].value, 1.0);
    }

    #[test]
    fn bad_lines() {
        let samples = parse("m{a=\"x\" 1\nn{a=x} 2\nv NaN\nw garbage\n");
        assert_eq!(
            samples
                .iter()
                .map(|s| (s.name.as_str(), s.value))
                .collect::<Vec<_>>(),
            vec![("v", 0.0), ("w", 0.0)]
        );
    }

    #[test]
    fn absent_metric_is_positive_zero() {
        let samples = parse("kapparmor_profiles_managed 2\n");
        let counter = counter_value(&samples, "kapparmor_profile_operations_total", &LabelSet::new());
        assert_eq!(format!("{} {}", counter, gauge_sum(&[], "kapparmor_profiles_managed")), "0 0");
    }
}
