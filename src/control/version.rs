/// Version-compatibility gate between control plane and data plane.
///
/// Only `major.minor` must agree: patch releases roll independently across
/// the fleet. A leading `v` is stripped; anything after the second dot
/// (including pre-release suffixes) is ignored, so `2.0` matches `2.0.1-rc1`.
/// Strings without two dotted components compare whole.
pub fn compatible_version(a: &str, b: &str) -> bool {
    match (major_minor(a), major_minor(b)) {
        (Some(a), Some(b)) => a == b,
        _ => normalize(a) == normalize(b),
    }
}

fn normalize(v: &str) -> &str {
    v.strip_prefix('v').unwrap_or(v)
}

fn major_minor(v: &str) -> Option<(&str, &str)> {
    let v = normalize(v);
    let mut parts = v.split('.');
    let major = parts.next()?;
    let minor = parts.next()?;
    if major.is_empty() || minor.is_empty() {
        return None;
    }
    Some((major, minor))
}
