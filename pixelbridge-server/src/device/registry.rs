//! The device registry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use super::{Device, Ordinal};

/// A generic device registry.
///
/// Tracks devices by ID, records which group and ordinal each device
/// claims, and drops entries when their devices become done. Devices that
/// report a new ordinal on re-registration are moved; duplicate ordinals
/// are tolerated but disqualify the ordinal from unique lookup.
///
/// The registry is a cheap-clone handle and safe for concurrent use.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    maps: RwLock<RegistryMaps>,
}

#[derive(Default)]
struct RegistryMaps {
    devices: HashMap<String, RegistryEntry>,
    groups: HashMap<i32, HashSet<String>>,
    ordinals: HashMap<Ordinal, HashSet<String>>,
}

struct RegistryEntry {
    device: Arc<dyn Device>,
    registered_group: i32,
    registered_ordinal: Ordinal,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry::default()
    }

    /// Adds or refreshes `d`'s registration.
    pub fn add(&self, d: Arc<dyn Device>) {
        let id = d.id().to_string();

        // Fast path under read lock: the device is registered and nothing
        // about its placement has changed.
        if self.check_registration(&id) {
            return;
        }

        let is_new = {
            let mut maps = self.inner.maps.write().unwrap();

            // Unregister entries that are already done, under lock. This
            // prevents a race where a done device is rediscovered before
            // its lifecycle task has removed it, and the re-registration
            // would be missed as a duplicate.
            maps.unregister_done_entries();

            let is_new = !maps.devices.contains_key(&id);
            if is_new {
                maps.devices.insert(
                    id.clone(),
                    RegistryEntry {
                        device: d.clone(),
                        registered_group: 0,
                        registered_ordinal: Ordinal::INVALID,
                    },
                );
            }
            maps.update_placement(&id, is_new);
            is_new
        };

        if is_new {
            // Unregister the device when it becomes done.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let registry = self.clone();
                let done = d.done();
                handle.spawn(async move {
                    done.wait().await;
                    registry.unregister_device(&d);
                });
            }
        }
    }

    /// Checks under read lock that `id` is fully registered, placed under
    /// its current ordinal, and not done.
    fn check_registration(&self, id: &str) -> bool {
        let maps = self.inner.maps.read().unwrap();

        let Some(e) = maps.devices.get(id) else {
            return false;
        };

        let ord = e.device.ordinal();
        if e.registered_group != ord.group || e.registered_ordinal != ord {
            return false;
        }
        !e.device.is_done()
    }

    /// The registered device for `id`, if present and not done.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Device>> {
        let maps = self.inner.maps.read().unwrap();
        let e = maps.devices.get(id)?;
        if e.device.is_done() {
            return None;
        }
        Some(e.device.clone())
    }

    /// The device uniquely registered for ordinal `o`.
    ///
    /// Returns `None` when no device, or more than one device, currently
    /// claims the ordinal.
    pub fn get_unique_ordinal(&self, o: Ordinal) -> Option<Arc<dyn Device>> {
        let maps = self.inner.maps.read().unwrap();
        let ids = maps.ordinals.get(&o)?;
        if ids.len() != 1 {
            return None;
        }
        let e = maps.devices.get(ids.iter().next().unwrap())?;
        if e.device.is_done() {
            return None;
        }
        Some(e.device.clone())
    }

    /// The devices registered to `group`, sorted by ID.
    pub fn devices_for_group(&self, group: i32) -> Vec<Arc<dyn Device>> {
        let maps = self.inner.maps.read().unwrap();
        maps.devices_for_group(group)
    }

    /// All registered groups and their devices.
    pub fn all_groups(&self) -> HashMap<i32, Vec<Arc<dyn Device>>> {
        let maps = self.inner.maps.read().unwrap();
        let mut groups = HashMap::new();
        for group in maps.groups.keys() {
            let devices = maps.devices_for_group(*group);
            if !devices.is_empty() {
                groups.insert(*group, devices);
            }
        }
        groups
    }

    /// Removes `d`'s registration, if `d` is still the registered instance
    /// for its ID.
    pub fn unregister_device(&self, d: &Arc<dyn Device>) {
        let mut maps = self.inner.maps.write().unwrap();
        if let Some(e) = maps.devices.get(d.id()) {
            if Arc::ptr_eq(&e.device, d) {
                maps.unregister_entry(d.id());
            }
        }
    }
}

impl RegistryMaps {
    fn update_placement(&mut self, id: &str, is_new: bool) {
        let Some(e) = self.devices.get(id) else {
            return;
        };
        let ordinal = e.device.ordinal();
        let (old_group, old_ordinal) = (e.registered_group, e.registered_ordinal);

        if is_new || old_group != ordinal.group {
            if !is_new {
                remove_from_set(&mut self.groups, &old_group, id);
            }
            self.groups
                .entry(ordinal.group)
                .or_default()
                .insert(id.to_string());
        }

        if is_new || old_ordinal != ordinal {
            if !is_new {
                remove_from_set(&mut self.ordinals, &old_ordinal, id);
            }
            self.ordinals
                .entry(ordinal)
                .or_default()
                .insert(id.to_string());
        }

        let e = self.devices.get_mut(id).unwrap();
        e.registered_group = ordinal.group;
        e.registered_ordinal = ordinal;
    }

    fn devices_for_group(&self, group: i32) -> Vec<Arc<dyn Device>> {
        let Some(ids) = self.groups.get(&group) else {
            return Vec::new();
        };

        let mut result: Vec<Arc<dyn Device>> = ids
            .iter()
            .filter_map(|id| self.devices.get(id))
            .filter(|e| !e.device.is_done())
            .map(|e| e.device.clone())
            .collect();
        result.sort_by(|a, b| a.id().cmp(b.id()));
        result
    }

    fn unregister_done_entries(&mut self) {
        let done: Vec<String> = self
            .devices
            .iter()
            .filter(|(_, e)| e.device.is_done())
            .map(|(id, _)| id.clone())
            .collect();
        for id in done {
            self.unregister_entry(&id);
        }
    }

    fn unregister_entry(&mut self, id: &str) {
        let Some(e) = self.devices.remove(id) else {
            return;
        };
        remove_from_set(&mut self.groups, &e.registered_group, id);
        remove_from_set(&mut self.ordinals, &e.registered_ordinal, id);
    }
}

fn remove_from_set<K: std::hash::Hash + Eq + Copy>(
    map: &mut HashMap<K, HashSet<String>>,
    key: &K,
    id: &str,
) {
    if let Some(set) = map.get_mut(key) {
        set.remove(id);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::remote::tests::test_headers;
    use super::super::Remote;
    use super::*;

    fn remote(id: &str, group: i32, controller: i32) -> Arc<dyn Device> {
        Arc::new(Remote::new(id, test_headers(9897, group, controller)))
    }

    #[tokio::test]
    async fn registers_and_fetches_by_id() {
        let reg = DeviceRegistry::new();
        let d = remote("aa:00", 1, 1);
        reg.add(d.clone());

        let got = reg.get("aa:00").unwrap();
        assert!(Arc::ptr_eq(&got, &d));
        assert!(reg.get("bb:00").is_none());
    }

    #[tokio::test]
    async fn unique_ordinal_requires_exactly_one_claimant() {
        let reg = DeviceRegistry::new();
        let o = Ordinal::new(2, 5);

        let a = remote("aa:00", 2, 5);
        let b = remote("bb:00", 2, 5);
        reg.add(a.clone());
        assert!(reg.get_unique_ordinal(o).is_some());

        // A second claimant disqualifies the ordinal.
        reg.add(b.clone());
        assert!(reg.get_unique_ordinal(o).is_none());

        // Removing one restores the survivor.
        reg.unregister_device(&a);
        let survivor = reg.get_unique_ordinal(o).unwrap();
        assert_eq!(survivor.id(), "bb:00");
    }

    #[tokio::test]
    async fn groups_are_sorted_by_id() {
        let reg = DeviceRegistry::new();
        reg.add(remote("bb:00", 3, 2));
        reg.add(remote("aa:00", 3, 1));
        reg.add(remote("cc:00", 4, 1));

        let group: Vec<String> = reg
            .devices_for_group(3)
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        assert_eq!(group, ["aa:00", "bb:00"]);

        let all = reg.all_groups();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&4].len(), 1);
    }

    #[tokio::test]
    async fn done_devices_are_not_returned() {
        let reg = DeviceRegistry::new();
        let d = Remote::new("aa:00", test_headers(9897, 1, 1));
        reg.add(Arc::new(d.clone()));

        d.mark_done();
        assert!(reg.get("aa:00").is_none());
        assert!(reg.get_unique_ordinal(Ordinal::new(1, 1)).is_none());
        assert!(reg.devices_for_group(1).is_empty());
    }

    #[tokio::test]
    async fn ordinal_change_moves_the_device() {
        let reg = DeviceRegistry::new();
        let d = Remote::new("aa:00", test_headers(9897, 1, 1));
        let arc: Arc<dyn Device> = Arc::new(d.clone());
        reg.add(arc.clone());
        assert!(reg.get_unique_ordinal(Ordinal::new(1, 1)).is_some());

        // The device announces a new ordinal; re-adding moves it.
        d.update_headers(std::time::SystemTime::now(), test_headers(9897, 9, 9));
        reg.add(arc);

        assert!(reg.get_unique_ordinal(Ordinal::new(1, 1)).is_none());
        assert!(reg.get_unique_ordinal(Ordinal::new(9, 9)).is_some());
        assert!(reg.devices_for_group(1).is_empty());
        assert_eq!(reg.devices_for_group(9).len(), 1);
    }
}
