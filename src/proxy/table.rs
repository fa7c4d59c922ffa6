//! Routing tables between guest objects and host objects
//!
//! Every guest object has exactly one entry. Paired entries point at their
//! host counterpart and the host side points back; local entries have no
//! host counterpart. Host objects the relay creates for its own use are
//! routed to an internal role instead of a guest object.

use super::interfaces::ObjectKind;
use std::collections::HashMap;
use std::hash::Hash;

/// Bookkeeping for one guest-visible object
#[derive(Debug, Clone, PartialEq)]
pub struct GuestEntry<H> {
    pub host: Option<H>,
    pub kind: ObjectKind,
    pub version: u32,
    /// Name of the host global this object was bound from
    pub global: Option<u32>,
}

/// Where events from a host object go
#[derive(Debug, Clone, PartialEq)]
pub enum HostRoute<G, R> {
    Guest(G),
    Internal(R),
}

pub struct ObjectTable<G, H, R> {
    guests: HashMap<G, GuestEntry<H>>,
    hosts: HashMap<H, HostRoute<G, R>>,
}

impl<G, H, R> Default for ObjectTable<G, H, R> {
    fn default() -> Self {
        Self {
            guests: HashMap::new(),
            hosts: HashMap::new(),
        }
    }
}

impl<G, H, R> ObjectTable<G, H, R>
where
    G: Clone + Eq + Hash,
    H: Clone + Eq + Hash,
    R: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a guest object and its host counterpart
    pub fn pair(&mut self, guest: G, kind: ObjectKind, version: u32, host: H) {
        self.hosts.insert(host.clone(), HostRoute::Guest(guest.clone()));
        self.guests.insert(
            guest,
            GuestEntry {
                host: Some(host),
                kind,
                version,
                global: None,
            },
        );
    }

    /// Records a guest object the relay implements itself
    pub fn insert_local(&mut self, guest: G, kind: ObjectKind, version: u32) {
        self.guests.insert(
            guest,
            GuestEntry {
                host: None,
                kind,
                version,
                global: None,
            },
        );
    }

    pub fn insert_internal(&mut self, host: H, role: R) {
        self.hosts.insert(host, HostRoute::Internal(role));
    }

    pub fn set_global(&mut self, guest: &G, global: u32) {
        if let Some(entry) = self.guests.get_mut(guest) {
            entry.global = Some(global);
        }
    }

    pub fn guest(&self, guest: &G) -> Option<&GuestEntry<H>> {
        self.guests.get(guest)
    }

    pub fn kind(&self, guest: &G) -> Option<ObjectKind> {
        self.guests.get(guest).map(|entry| entry.kind)
    }

    pub fn host_of(&self, guest: &G) -> Option<H> {
        self.guests.get(guest).and_then(|entry| entry.host.clone())
    }

    pub fn route(&self, host: &H) -> Option<&HostRoute<G, R>> {
        self.hosts.get(host)
    }

    pub fn guest_of(&self, host: &H) -> Option<G> {
        match self.hosts.get(host) {
            Some(HostRoute::Guest(guest)) => Some(guest.clone()),
            _ => None,
        }
    }

    pub fn role_of(&self, host: &H) -> Option<R> {
        match self.hosts.get(host) {
            Some(HostRoute::Internal(role)) => Some(role.clone()),
            _ => None,
        }
    }

    /// Forgets a guest object, returning its entry.
    ///
    /// The host counterpart, if still attached, is unrouted as well; the
    /// caller decides whether it needs an explicit destructor.
    pub fn remove_guest(&mut self, guest: &G) -> Option<GuestEntry<H>> {
        let entry = self.guests.remove(guest)?;
        if let Some(host) = &entry.host {
            self.hosts.remove(host);
        }
        Some(entry)
    }

    /// Cuts the pairing after the host object was destroyed
    pub fn detach_host(&mut self, guest: &G) -> Option<H> {
        let host = self.guests.get_mut(guest)?.host.take()?;
        self.hosts.remove(&host);
        Some(host)
    }

    /// Forgets a host object; a paired guest object becomes local
    pub fn remove_host(&mut self, host: &H) -> Option<HostRoute<G, R>> {
        let route = self.hosts.remove(host)?;
        if let HostRoute::Guest(guest) = &route {
            if let Some(entry) = self.guests.get_mut(guest) {
                entry.host = None;
            }
        }
        Some(route)
    }

    /// Guest objects bound from the host global `name`
    pub fn bound_from(&self, name: u32) -> Vec<G> {
        self.guests
            .iter()
            .filter(|(_, entry)| entry.global == Some(name))
            .map(|(guest, _)| guest.clone())
            .collect()
    }

    /// Cuts every pairing made through the host global `name`, returning
    /// the host objects that still need a destructor
    pub fn detach_bound(&mut self, name: u32) -> Vec<H> {
        self.bound_from(name)
            .iter()
            .filter_map(|guest| self.detach_host(guest))
            .collect()
    }

    /// Guest objects of one kind
    pub fn of_kind(&self, kind: ObjectKind) -> impl Iterator<Item = &G> + '_ {
        self.guests
            .iter()
            .filter(move |(_, entry)| entry.kind == kind)
            .map(|(guest, _)| guest)
    }

    /// Host objects serving an internal role
    pub fn internal(&self) -> impl Iterator<Item = (&H, &R)> + '_ {
        self.hosts.iter().filter_map(|(host, route)| match route {
            HostRoute::Internal(role) => Some((host, role)),
            HostRoute::Guest(_) => None,
        })
    }

    pub fn guest_count(&self) -> usize {
        self.guests.len()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Table = ObjectTable<u32, u32, &'static str>;

    #[test]
    fn test_pair_routes_both_ways() {
        let mut table = Table::new();
        table.pair(10, ObjectKind::Surface, 3, 100);

        assert_eq!(table.host_of(&10), Some(100));
        assert_eq!(table.guest_of(&100), Some(10));
        assert_eq!(table.kind(&10), Some(ObjectKind::Surface));
        assert_eq!(table.role_of(&100), None);
    }

    #[test]
    fn test_remove_guest_unroutes_host() {
        let mut table = Table::new();
        table.pair(10, ObjectKind::Buffer, 1, 100);
        let entry = table.remove_guest(&10).unwrap();
        assert_eq!(entry.host, Some(100));
        assert!(table.route(&100).is_none());
        assert_eq!(table.host_count(), 0);
    }

    #[test]
    fn test_remove_host_leaves_local_guest() {
        let mut table = Table::new();
        table.pair(7, ObjectKind::Output, 3, 70);
        table.set_global(&7, 42);

        assert!(matches!(table.remove_host(&70), Some(HostRoute::Guest(7))));
        let entry = table.guest(&7).unwrap();
        assert_eq!(entry.host, None);
        assert_eq!(table.bound_from(42), vec![7]);
    }

    #[test]
    fn test_detach_after_forwarded_destructor() {
        let mut table = Table::new();
        table.pair(5, ObjectKind::Region, 1, 50);
        assert_eq!(table.detach_host(&5), Some(50));
        assert_eq!(table.detach_host(&5), None);
        assert!(table.remove_guest(&5).unwrap().host.is_none());
    }

    #[test]
    fn test_detach_bound_keeps_other_globals() {
        let mut table = Table::new();
        table.pair(7, ObjectKind::Subcompositor, 1, 70);
        table.set_global(&7, 3);
        table.pair(8, ObjectKind::Subcompositor, 1, 80);
        table.set_global(&8, 3);
        table.pair(9, ObjectKind::Compositor, 3, 90);
        table.set_global(&9, 1);
        table.insert_local(10, ObjectKind::Output, 3);
        table.set_global(&10, 3);

        let mut detached = table.detach_bound(3);
        detached.sort();
        assert_eq!(detached, vec![70, 80]);
        assert!(table.route(&70).is_none());
        assert_eq!(table.host_of(&7), None);
        assert_eq!(table.guest_count(), 4);
        assert_eq!(table.host_of(&9), Some(90));
        assert!(table.detach_bound(3).is_empty());
    }

    #[test]
    fn test_internal_roles() {
        let mut table = Table::new();
        table.insert_internal(1, "registry");
        table.insert_local(3, ObjectKind::ShmPool, 1);
        table.pair(4, ObjectKind::Surface, 3, 2);

        let internal: Vec<_> = table.internal().collect();
        assert_eq!(internal, vec![(&1, &"registry")]);
        assert_eq!(table.role_of(&1), Some("registry"));
        assert_eq!(table.of_kind(ObjectKind::ShmPool).count(), 1);
        assert_eq!(table.guest_count(), 2);
    }
}
