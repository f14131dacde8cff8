const KIB: f64 = 1024.0;

pub fn parse_size(token: &str) -> u64 {
    let token = token.trim();
    let (number, rest) = split_number(token);
    let Some(value) = number.and_then(|n| n.parse::<f64>().ok()) else {
        return 0;
    };

    let multiplier = unit_multiplier(rest.trim_start()).unwrap_or(1.0);
    to_bytes(value * multiplier)
}

fn unit_multiplier(suffix: &str) -> Option<f64> {
    let mut chars = suffix.chars();
    let exponent = match chars.next()?.to_ascii_uppercase() {
        'K' => 1,
        'M' => 2,
        'G' => 3,
        'T' => 4,
        _ => return None,
    };
    match chars.as_str() {
        "" | "i" | "I" => Some(KIB.powi(exponent)),
        _ => None,
    }
}

fn split_number(token: &str) -> (Option<&str>, &str) {
    let bytes = token.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        return (None, token);
    }
    if end + 1 < bytes.len() && bytes[end] == b'.' && bytes[end + 1].is_ascii_digit() {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    (Some(&token[..end]), &token[end..])
}

fn to_bytes(value: f64) -> u64 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    value.round() as u64
}
