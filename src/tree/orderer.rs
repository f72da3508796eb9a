use serde::{Deserialize, Serialize};

/// Order value of children that do not declare one
pub const DEFAULT_ORDER: i32 = i32::MAX / 2;

/// Reorders a container's children before they run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildOrderer {
    /// Alphabetical by display name
    DisplayName,
    /// Ascending by declared order value
    OrderValue,
    /// Shuffled; falls back to the engine's seed when none is given
    Random { seed: Option<u64> },
}

/// What an orderer needs to know about a child
#[derive(Debug, Clone)]
pub struct OrderKey<T> {
    pub item: T,
    pub display_name: String,
    pub order: Option<i32>,
}

impl ChildOrderer {
    /// Sort `children` in place; equal keys keep their declaration order
    pub fn order<T>(&self, children: &mut [OrderKey<T>], engine_seed: u64) {
        match self {
            Self::DisplayName => children.sort_by(|a, b| a.display_name.cmp(&b.display_name)),
            Self::OrderValue => children.sort_by_key(|child| child.order.unwrap_or(DEFAULT_ORDER)),
            Self::Random { seed } => {
                let mut rng = fastrand::Rng::with_seed(seed.unwrap_or(engine_seed));
                rng.shuffle(children);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Vec<OrderKey<usize>> {
        vec![
            OrderKey { item: 0, display_name: "c".into(), order: None },
            OrderKey { item: 1, display_name: "a".into(), order: Some(2) },
            OrderKey { item: 2, display_name: "b".into(), order: Some(1) },
        ]
    }

    fn items(keys: &[OrderKey<usize>]) -> Vec<usize> {
        keys.iter().map(|k| k.item).collect()
    }

    #[test]
    fn test_display_name() {
        let mut children = keys();
        ChildOrderer::DisplayName.order(&mut children, 0);
        assert_eq!(items(&children), vec![1, 2, 0]);
    }

    #[test]
    fn test_order_value_puts_undeclared_last() {
        let mut children = keys();
        ChildOrderer::OrderValue.order(&mut children, 0);
        assert_eq!(items(&children), vec![2, 1, 0]);
    }

    #[test]
    fn test_random_is_deterministic_per_seed() {
        let mut first: Vec<OrderKey<usize>> = (0..20)
            .map(|i| OrderKey { item: i, display_name: i.to_string(), order: None })
            .collect();
        let mut second = first.clone();
        ChildOrderer::Random { seed: None }.order(&mut first, 42);
        ChildOrderer::Random { seed: Some(42) }.order(&mut second, 7);
        assert_eq!(items(&first), items(&second));
    }
}
