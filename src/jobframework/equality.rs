//! Semantic equality for pod template parts.
//!
//! Absent and empty lists or maps are equal, and quantities compare by value, so `1` and `1000m`
//! are the same CPU request.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// `mantissa * 10^exp10 * 1024^exp1024`
#[derive(Debug, PartialEq)]
struct ParsedQuantity {
    mantissa: i128,
    exp10: i32,
    exp1024: u32,
}

fn parse_quantity(value: &str) -> Option<ParsedQuantity> {
    let value = value.trim();
    let pos = value
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(pos);

    let (mut exp10, exp1024) = match suffix {
        "" => (0, 0),
        "n" => (-9, 0),
        "u" => (-6, 0),
        "m" => (-3, 0),
        "k" => (3, 0),
        "M" => (6, 0),
        "G" => (9, 0),
        "T" => (12, 0),
        "P" => (15, 0),
        "E" => (18, 0),
        "Ki" => (0, 1),
        "Mi" => (0, 2),
        "Gi" => (0, 3),
        "Ti" => (0, 4),
        "Pi" => (0, 5),
        "Ei" => (0, 6),
        s if s.starts_with(['e', 'E']) => (s[1..].parse::<i32>().ok()?, 0),
        _ => return None,
    };

    let (negative, digits) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }

    let mut mantissa: i128 = 0;
    for c in int_part.chars().chain(frac_part.chars()) {
        let digit = i128::from(c.to_digit(10)?);
        mantissa = mantissa.checked_mul(10)?.checked_add(digit)?;
    }
    exp10 = exp10.checked_sub(i32::try_from(frac_part.len()).ok()?)?;

    Some(ParsedQuantity {
        mantissa: if negative { -mantissa } else { mantissa },
        exp10,
        exp1024,
    })
}

fn scaled(q: &ParsedQuantity, exp10: i32) -> Option<i128> {
    let shift = u32::try_from(q.exp10 - exp10).ok()?;
    q.mantissa
        .checked_mul(10i128.checked_pow(shift)?)?
        .checked_mul(1024i128.checked_pow(q.exp1024)?)
}

/// Compares by value. Unparsable or out-of-range quantities only match verbatim.
pub fn quantity_eq(a: &Quantity, b: &Quantity) -> bool {
    if a.0 == b.0 {
        return true;
    }
    let (Some(a), Some(b)) = (parse_quantity(&a.0), parse_quantity(&b.0)) else {
        return false;
    };
    let exp10 = a.exp10.min(b.exp10);
    match (scaled(&a, exp10), scaled(&b, exp10)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn quantities_equal(
    a: Option<&BTreeMap<String, Quantity>>,
    b: Option<&BTreeMap<String, Quantity>>,
) -> bool {
    let empty = BTreeMap::new();
    let (a, b) = (a.unwrap_or(&empty), b.unwrap_or(&empty));
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|((ka, va), (kb, vb))| ka == kb && quantity_eq(va, vb))
}

pub fn resources_equal(a: Option<&ResourceRequirements>, b: Option<&ResourceRequirements>) -> bool {
    let empty = ResourceRequirements::default();
    let (a, b) = (a.unwrap_or(&empty), b.unwrap_or(&empty));
    a.claims.as_deref().unwrap_or_default() == b.claims.as_deref().unwrap_or_default()
        && quantities_equal(a.limits.as_ref(), b.limits.as_ref())
        && quantities_equal(a.requests.as_ref(), b.requests.as_ref())
}

fn container_equal(a: &Container, b: &Container) -> bool {
    let without_resources = |c: &Container| Container {
        resources: None,
        ..c.clone()
    };
    without_resources(a) == without_resources(b)
        && resources_equal(a.resources.as_ref(), b.resources.as_ref())
}

pub fn containers_equal(a: Option<&[Container]>, b: Option<&[Container]>) -> bool {
    let (a, b) = (a.unwrap_or_default(), b.unwrap_or_default());
    a.len() == b.len() && a.iter().zip(b).all(|(a, b)| container_equal(a, b))
}
