use std::cmp::Ordering;

/// Sort key for a chromosome or contig name. Numbered chromosomes come first
/// in numeric order, then sex chromosomes (X, Y, W, Z), then mitochondria,
/// then other named contigs (`6_random`, `GL000220.1`), then unplaced `Un`
/// contigs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct KaryotypeKey {
    class: u8,
    number: u64,
    name: String,
}

pub fn karyotype_key(name: &str) -> KaryotypeKey {
    let bare = strip_chr(name.trim());
    let upper = bare.to_ascii_uppercase();

    if !bare.is_empty() && bare.chars().all(|ch| ch.is_ascii_digit()) {
        return KaryotypeKey {
            class: 0,
            number: bare.parse().unwrap_or(u64::MAX),
            name: String::new(),
        };
    }
    let sex = match upper.as_str() {
        "X" => Some(0),
        "Y" => Some(1),
        "W" => Some(2),
        "Z" => Some(3),
        _ => None,
    };
    if let Some(rank) = sex {
        return KaryotypeKey {
            class: 1,
            number: rank,
            name: String::new(),
        };
    }
    if upper == "M" || upper == "MT" {
        return KaryotypeKey {
            class: 2,
            number: 0,
            name: String::new(),
        };
    }
    if upper == "UN" || upper.starts_with("UN_") {
        return KaryotypeKey {
            class: 4,
            number: 0,
            name: upper,
        };
    }
    let leading = bare
        .chars()
        .take_while(|ch| ch.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap_or(u64::MAX);
    KaryotypeKey {
        class: 3,
        number: leading,
        name: upper,
    }
}

fn strip_chr(name: &str) -> &str {
    match name.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("chr") && name.len() > 3 => &name[3..],
        _ => name,
    }
}

pub fn compare(left: &str, right: &str) -> Ordering {
    karyotype_key(left).cmp(&karyotype_key(right))
}

/// Stable sort of record names into karyotype order.
pub fn sort_names<T, F>(items: &mut [T], name: F)
where
    F: Fn(&T) -> &str,
{
    items.sort_by(|left, right| compare(name(left), name(right)));
}
