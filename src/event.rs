//! Event input: pedestal-corrected charge per (projection, strip, time cell).
//!
//! The reconstruction core only sees charges through `ChargeSource`. Where
//! those charges come from (files, online readout, Monte Carlo) is the
//! business of an `EventSource`.

use std::collections::BTreeMap;

use geometry::{GeometryTPC, Projection};

use crate::histogram::Histo2D;
use crate::toymc::{ToyEvent, ToyGenerator};

/// Charge map of one event
pub trait ChargeSource {

    /// Charge on `strip` (0-based) of projection `dir` in time cell `cell`
    fn charge_at(&self, dir: Projection, strip: usize, cell: usize) -> f64;

    /// The whole of projection `dir` as a (time, strip) histogram
    fn to_histo2d(&self, dir: Projection, geometry: &GeometryTPC) -> Histo2D {
        let mut histo = Histo2D::for_projection(geometry, dir);
        for cell in 0..geometry.n_timecells() {
            for strip in 0..geometry.n_strips(dir) {
                let q = self.charge_at(dir, strip, cell);
                if q != 0.0 { histo.set(cell, strip, q); }
            }
        }
        histo
    }
}

/// Key of one readout channel sample
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChargeKey {
    pub dir  : Projection,
    pub strip: usize,
    pub cell : usize,
}

/// Sparse charge map of one event; absent samples carry no charge
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventCharges {
    id       : u64,
    timestamp: u64,
    charges  : BTreeMap<ChargeKey, f64>,
}

impl EventCharges {

    pub fn new(id: u64, timestamp: u64) -> Self { Self { id, timestamp, charges: BTreeMap::new() } }

    pub fn id       (&self) -> u64 { self.id }
    /// Trigger time in clock ticks
    pub fn timestamp(&self) -> u64 { self.timestamp }

    pub fn len     (&self) -> usize { self.charges.len() }
    pub fn is_empty(&self) -> bool { self.charges.is_empty() }

    pub fn insert(&mut self, dir: Projection, strip: usize, cell: usize, charge: f64) {
        self.charges.insert(ChargeKey { dir, strip, cell }, charge);
    }

    pub fn add(&mut self, dir: Projection, strip: usize, cell: usize, charge: f64) {
        *self.charges.entry(ChargeKey { dir, strip, cell }).or_insert(0.0) += charge;
    }

    /// Read-only view of all stored samples, ordered by projection, strip and cell
    pub fn charge_map_view(&self) -> &BTreeMap<ChargeKey, f64> { &self.charges }

    /// Samples of one projection
    pub fn projection(&self, dir: Projection) -> impl Iterator<Item = (&ChargeKey, &f64)> + '_ {
        let lo = ChargeKey { dir, strip: 0, cell: 0 };
        let hi = ChargeKey { dir, strip: usize::MAX, cell: usize::MAX };
        self.charges.range(lo..=hi)
    }

    pub fn total_charge(&self, dir: Option<Projection>) -> f64 {
        match dir {
            Some(dir) => self.projection(dir).map(|(_, q)| q).sum(),
            None      => self.charges.values().sum(),
        }
    }
}

impl ChargeSource for EventCharges {
    fn charge_at(&self, dir: Projection, strip: usize, cell: usize) -> f64 {
        self.charges.get(&ChargeKey { dir, strip, cell }).copied().unwrap_or(0.0)
    }

    /// Samples outside the geometry are dropped
    fn to_histo2d(&self, dir: Projection, geometry: &GeometryTPC) -> Histo2D {
        let mut histo = Histo2D::for_projection(geometry, dir);
        for (key, &q) in self.projection(dir) {
            histo.add(key.cell, key.strip, q);
        }
        histo
    }
}

/// Sequential or random access to the events of a run
pub trait EventSource {
    fn number_of_entries(&self) -> usize;

    /// Make entry `entry` current. `None` past the last entry.
    fn load_entry(&mut self, entry: usize) -> Option<&EventCharges>;

    fn current_event(&self) -> Option<&EventCharges>;
}

/// Reproducible stream of Monte Carlo events. Entry `i` is always generated
/// from the same random seed, whatever the order of access.
pub struct ToyEventSource {
    generator: ToyGenerator,
    seed     : u64,
    entries  : usize,
    template : Option<ToyEvent>,
    current  : Option<(EventCharges, ToyEvent)>,
}

impl ToyEventSource {

    /// Random topologies
    pub fn new(generator: ToyGenerator, seed: u64, entries: usize) -> Self {
        Self { generator, seed, entries, template: None, current: None }
    }

    /// Every entry deposits the same track; only fluctuations differ
    pub fn repeating(generator: ToyGenerator, seed: u64, entries: usize, event: ToyEvent) -> Self {
        Self { generator, seed, entries, template: Some(event), current: None }
    }

    /// True topology of the current event
    pub fn current_truth(&self) -> Option<&ToyEvent> { self.current.as_ref().map(|(_, truth)| truth) }
}

impl EventSource for ToyEventSource {
    fn number_of_entries(&self) -> usize { self.entries }

    fn load_entry(&mut self, entry: usize) -> Option<&EventCharges> {
        if entry >= self.entries {
            log::debug!("entry {entry} beyond the {} available", self.entries);
            return None
        }
        let mut rng = ToyGenerator::rng(self.seed.wrapping_add(entry as u64));
        let truth   = match &self.template {
            Some(event) => event.clone(),
            None        => self.generator.random_event(&mut rng),
        };
        let charges = self.generator.deposit(&truth, entry as u64, &mut rng);
        self.current = Some((charges, truth));
        self.current_event()
    }

    fn current_event(&self) -> Option<&EventCharges> { self.current.as_ref().map(|(charges, _)| charges) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    use crate::toymc::ToyParams;
    use crate::types::Vec3;

    #[test]
    fn sparse_map_accumulates() {
        let mut event = EventCharges::new(7, 1000);
        event.add(Projection::V, 3, 100, 2.0);
        event.add(Projection::V, 3, 100, 3.0);
        event.insert(Projection::U, 0, 5, 1.5);
        event.insert(Projection::W, 9, 1, 4.0);
        assert_eq!(event.len(), 3);
        assert_eq!(event.charge_at(Projection::V, 3, 100), 5.0);
        assert_eq!(event.charge_at(Projection::V, 4, 100), 0.0);
        assert_eq!(event.total_charge(Some(Projection::V)), 5.0);
        assert_eq!(event.total_charge(None), 10.5);
        let keys: Vec<_> = event.charge_map_view().keys().map(|k| k.dir).collect();
        assert_eq!(keys, vec![Projection::U, Projection::V, Projection::W]);
    }

    #[test]
    fn sparse_and_generic_materialisation_agree() {
        struct Dense<'a>(&'a EventCharges);
        impl ChargeSource for Dense<'_> {
            fn charge_at(&self, dir: Projection, strip: usize, cell: usize) -> f64 { self.0.charge_at(dir, strip, cell) }
        }
        let geometry = GeometryTPC::default();
        let mut event = EventCharges::new(0, 0);
        event.insert(Projection::W, 12, 300, 8.0);
        event.insert(Projection::W, 13, 301, 2.0);
        event.insert(Projection::W, 10_000, 0, 1.0); // no such strip
        let sparse = event.to_histo2d(Projection::W, &geometry);
        assert_eq!(sparse, Dense(&event).to_histo2d(Projection::W, &geometry));
        assert_eq!(sparse.get(300, 12), 8.0);
        assert_eq!(sparse.integral(), 10.0);
    }

    #[test]
    fn toy_entries_are_reproducible() {
        let geometry  = Arc::new(GeometryTPC::default());
        let generator = ToyGenerator::new(geometry, ToyParams { noise: 2.0, ..ToyParams::default() }).unwrap();
        let event = ToyEvent::single(Vec3::new(-10.0, 0.0, -10.0), Vec3::new(20.0, 10.0, 15.0), 2.0);
        let mut source = ToyEventSource::repeating(generator, 42, 3, event);
        assert_eq!(source.number_of_entries(), 3);
        assert!(source.current_event().is_none());
        let second = source.load_entry(1).unwrap().clone();
        source.load_entry(0).unwrap();
        assert_eq!(source.load_entry(1).unwrap(), &second);
        assert_eq!(source.current_truth().unwrap().prongs.len(), 1);
        assert!(source.load_entry(3).is_none());
    }
}
