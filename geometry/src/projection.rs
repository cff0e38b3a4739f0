use std::fmt;

/// One of the three strip read-out directions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Projection { U, V, W }

impl Projection {

    pub const ALL: [Projection; 3] = [Projection::U, Projection::V, Projection::W];

    pub fn index(self) -> usize {
        match self {
            Projection::U => 0,
            Projection::V => 1,
            Projection::W => 2,
        }
    }

    pub fn from_index(i: usize) -> Option<Self> { Self::ALL.get(i).copied() }

    /// The two projections other than `self`, in U, V, W order
    pub fn others(self) -> [Projection; 2] {
        match self {
            Projection::U => [Projection::V, Projection::W],
            Projection::V => [Projection::U, Projection::W],
            Projection::W => [Projection::U, Projection::V],
        }
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Projection::U => "U",
            Projection::V => "V",
            Projection::W => "W",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_round_trip() {
        for dir in Projection::ALL {
            assert_eq!(Projection::from_index(dir.index()), Some(dir));
        }
        assert_eq!(Projection::from_index(3), None);
    }

    #[test]
    fn others_exclude_self() {
        for dir in Projection::ALL {
            assert!(!dir.others().contains(&dir));
        }
    }
}
