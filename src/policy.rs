//! Book allocation policies and the `user.LFS.*` xattr intrinsics.
//!
//! A policy is a pure selection: given a caller context and a count, pick up
//! to that many FREE books from the store.  State changes stay with the
//! engine; a policy that mutated books would wreck the transaction story.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::books::{Book, Shelf};
use crate::error::EngineError;
use crate::proto::Context;
use crate::store::MetadataStore;
use crate::topology::Topology;

/// Reserved xattr carrying a shelf's allocation policy (RW, enum-checked).
pub const XATTR_POLICY: &str = "user.LFS.AllocationPolicy";
/// Read-only: the comma-joined policy set.
pub const XATTR_POLICY_LIST: &str = "user.LFS.AllocationPolicyList";
/// Read-only: one byte per book on the shelf, giving its IG.
pub const XATTR_INTERLEAVE: &str = "user.LFS.Interleave";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationPolicy {
    LocalNode,
    Nearest,
    RandomBooks,
    LzaAscending,
    LzaDescending,
}

pub const POLICY_DEFAULT: AllocationPolicy = AllocationPolicy::RandomBooks;

impl AllocationPolicy {
    pub const ALL: [AllocationPolicy; 5] = [
        AllocationPolicy::LocalNode,
        AllocationPolicy::Nearest,
        AllocationPolicy::RandomBooks,
        AllocationPolicy::LzaAscending,
        AllocationPolicy::LzaDescending,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalNode => "LocalNode",
            Self::Nearest => "Nearest",
            Self::RandomBooks => "RandomBooks",
            Self::LzaAscending => "LZAascending",
            Self::LzaDescending => "LZAdescending",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == name)
    }

    /// The comma-joined set, as served by `user.LFS.AllocationPolicyList`.
    pub fn names() -> String {
        Self::ALL
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Resolve a shelf's policy from its xattr; absent means the default.
    pub fn for_shelf<S: MetadataStore>(
        store: &mut S,
        shelf: &Shelf,
    ) -> Result<Self, EngineError> {
        match store.get_xattr(shelf.id, XATTR_POLICY)? {
            None => Ok(POLICY_DEFAULT),
            Some(name) => Self::from_name(&name)
                .ok_or_else(|| EngineError::Unimplemented(format!("policy \"{name}\""))),
        }
    }

    /// Pick up to `books_needed` FREE books.  May return fewer; never
    /// returns duplicates; never touches book state.
    pub fn allocate<S: MetadataStore>(
        self,
        store: &mut S,
        topology: &Topology,
        ctx: &Context,
        books_needed: usize,
        rng: &mut impl Rng,
    ) -> Result<Vec<Book>, EngineError> {
        let local_ig = topology.ig_of_node(ctx.node_id);
        match self {
            Self::LocalNode => {
                store.get_books_by_intlv_group(Some(books_needed), &[local_ig], false, true)
            }
            Self::Nearest => {
                // Local books first, in store order: mappings already built
                // against them must stay stable across a regrow.
                let mut picked =
                    store.get_books_by_intlv_group(Some(books_needed), &[local_ig], false, true)?;

                let enc = topology.enclosure_of_node(ctx.node_id);
                let mut enclosure_igs: Vec<u8> = topology
                    .nodes_in_enclosure(enc)
                    .filter(|&n| n != ctx.node_id)
                    .map(|n| topology.ig_of_node(n))
                    .collect();

                if picked.len() < books_needed {
                    let mut pool =
                        store.get_books_by_intlv_group(None, &enclosure_igs, false, true)?;
                    pool.shuffle(rng);
                    picked.extend(pool.into_iter().take(books_needed - picked.len()));
                }

                if picked.len() < books_needed {
                    // rack-wide top-up: everything outside the enclosure
                    enclosure_igs.push(local_ig);
                    let mut pool =
                        store.get_books_by_intlv_group(None, &enclosure_igs, true, true)?;
                    pool.shuffle(rng);
                    picked.extend(pool.into_iter().take(books_needed - picked.len()));
                }
                Ok(picked)
            }
            Self::RandomBooks => {
                let mut pool = store.get_books_by_intlv_group(None, &[], true, true)?;
                pool.shuffle(rng);
                pool.truncate(books_needed);
                Ok(pool)
            }
            Self::LzaAscending => {
                store.get_books_by_intlv_group(Some(books_needed), &[], true, true)
            }
            Self::LzaDescending => {
                store.get_books_by_intlv_group(Some(books_needed), &[], true, false)
            }
        }
    }
}

/// Split a `user.LFS.xxx` name; `None` for anything outside the LFS space.
fn lfs_leaf(name: &str) -> Result<Option<&str>, EngineError> {
    let elems: Vec<&str> = name.split('.').collect();
    if elems.get(1).copied() != Some("LFS") {
        return Ok(None);
    }
    if elems.len() != 3 {
        return Err(EngineError::Invalid(format!(
            "LFS xattrs are of form \"user.LFS.xxx\", not \"{name}\""
        )));
    }
    Ok(Some(elems[2]))
}

/// Validate a set.  LFS names other than the policy knob are refused.
pub fn check_set(name: &str, value: &str) -> Result<(), EngineError> {
    match lfs_leaf(name)? {
        None => Ok(()),
        Some("AllocationPolicy") => {
            if AllocationPolicy::from_name(value).is_none() {
                return Err(EngineError::Invalid(format!(
                    "bad AllocationPolicy \"{value}\""
                )));
            }
            Ok(())
        }
        Some(leaf) => Err(EngineError::Invalid(format!(
            "setting \"user.LFS.{leaf}\" is prohibited"
        ))),
    }
}

/// Validate a removal.  LFS xattrs can never be removed.
pub fn check_remove(name: &str) -> Result<(), EngineError> {
    if lfs_leaf(name)?.is_some() {
        return Err(EngineError::Invalid(
            "removal of LFS xattrs is prohibited".to_string(),
        ));
    }
    Ok(())
}

/// Values computed rather than stored.  `None` means a plain lookup.
pub fn special_get<S: MetadataStore>(
    store: &mut S,
    shelf: &Shelf,
    name: &str,
) -> Result<Option<String>, EngineError> {
    match lfs_leaf(name)? {
        Some("AllocationPolicyList") => Ok(Some(AllocationPolicy::names())),
        Some("Interleave") => {
            let bos = store.get_bos_by_shelf_id(shelf.id)?;
            let mut igs = String::with_capacity(bos.len());
            for row in &bos {
                let book = store.get_book_by_id(row.book_id)?.ok_or_else(|| {
                    EngineError::not_found("book", format!("{:#x}", row.book_id))
                })?;
                igs.push(book.intlv_group() as char);
            }
            Ok(Some(igs))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::books::lza;
    use crate::store::{MemStore, ShelfMatch};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ctx(node_id: u32) -> Context {
        Context {
            node_id,
            uid: 0,
            gid: 0,
            pid: 7,
            umask: 0,
        }
    }

    // 12 nodes across two enclosures, 5 books each
    fn fixture() -> (Topology, MemStore) {
        let igs: String = (0..12)
            .map(|i| format!("\"{i}\": 5"))
            .collect::<Vec<_>>()
            .join(",");
        let topo = Topology::from_json(&format!(
            r#"{{ "bookSize": "1M", "booksPerIG": {{ {igs} }} }}"#
        ))
        .unwrap();
        let store = MemStore::new(&topo);
        (topo, store)
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x10ca1b00c)
    }

    #[test]
    fn names_round_trip() {
        for p in AllocationPolicy::ALL {
            assert_eq!(AllocationPolicy::from_name(p.as_str()), Some(p));
        }
        assert!(AllocationPolicy::from_name("Bogus").is_none());
        assert_eq!(
            AllocationPolicy::names(),
            "LocalNode,Nearest,RandomBooks,LZAascending,LZAdescending"
        );
    }

    #[test]
    fn local_node_stays_home() {
        let (topo, mut store) = fixture();
        let got = AllocationPolicy::LocalNode
            .allocate(&mut store, &topo, &ctx(3), 3, &mut rng())
            .unwrap();
        assert_eq!(got.len(), 3);
        assert!(got.iter().all(|b| b.intlv_group() == 2));

        // may under-deliver, never overflow to another IG
        let got = AllocationPolicy::LocalNode
            .allocate(&mut store, &topo, &ctx(3), 9, &mut rng())
            .unwrap();
        assert_eq!(got.len(), 5);
    }

    #[test]
    fn nearest_prefers_enclosure() {
        let (topo, mut store) = fixture();

        // leave node 2 with two free books
        for num in 2..5 {
            let mut b = store.get_book_by_id(lza(1, num)).unwrap().unwrap();
            b.transition(crate::books::BookState::InUse).unwrap();
            store.modify_book(&b).unwrap();
        }

        let got = AllocationPolicy::Nearest
            .allocate(&mut store, &topo, &ctx(2), 6, &mut rng())
            .unwrap();
        assert_eq!(got.len(), 6);
        // two local, stable and first
        assert_eq!(got[0].id, lza(1, 0));
        assert_eq!(got[1].id, lza(1, 1));
        // the top-up never leaves enclosure 1 (nodes 1..=10) while it has
        // free books
        assert!(got[2..].iter().all(|b| b.node_id <= 10 && b.node_id != 2));
        // no duplicates
        let mut ids: Vec<u64> = got.iter().map(|b| b.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn nearest_spills_rack_wide_only_when_starved() {
        let (topo, mut store) = fixture();

        // enclosure 1 has exactly 5 free books total, all on node 1
        for node in 2..=10u32 {
            for num in 0..5 {
                let mut b = store
                    .get_book_by_id(lza((node - 1) as u8, num))
                    .unwrap()
                    .unwrap();
                b.transition(crate::books::BookState::InUse).unwrap();
                store.modify_book(&b).unwrap();
            }
        }

        let got = AllocationPolicy::Nearest
            .allocate(&mut store, &topo, &ctx(1), 8, &mut rng())
            .unwrap();
        assert_eq!(got.len(), 8);
        assert!(got[..5].iter().all(|b| b.node_id == 1));
        assert!(got[5..].iter().all(|b| b.node_id >= 11));
    }

    #[test]
    fn lza_ordered_policies() {
        let (topo, mut store) = fixture();
        let asc = AllocationPolicy::LzaAscending
            .allocate(&mut store, &topo, &ctx(1), 7, &mut rng())
            .unwrap();
        assert_eq!(asc.len(), 7);
        assert!(asc.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(asc[0].id, lza(0, 0));

        let desc = AllocationPolicy::LzaDescending
            .allocate(&mut store, &topo, &ctx(1), 7, &mut rng())
            .unwrap();
        assert_eq!(desc.len(), 7);
        assert!(desc.windows(2).all(|w| w[0].id > w[1].id));
        assert_eq!(desc[0].id, lza(11, 4));
    }

    #[test]
    fn random_books_covers_the_pool() {
        let (topo, mut store) = fixture();
        let got = AllocationPolicy::RandomBooks
            .allocate(&mut store, &topo, &ctx(1), 60, &mut rng())
            .unwrap();
        assert_eq!(got.len(), 60);
        let mut ids: Vec<u64> = got.iter().map(|b| b.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 60);
    }

    #[test]
    fn xattr_rules() {
        assert!(check_set("user.color", "red").is_ok());
        assert!(check_set(XATTR_POLICY, "LocalNode").is_ok());
        assert!(check_set(XATTR_POLICY, "Bogus").is_err());
        assert!(check_set(XATTR_POLICY_LIST, "anything").is_err());
        assert!(check_set(XATTR_INTERLEAVE, "anything").is_err());
        assert!(check_set("user.LFS.NoSuchThing", "x").is_err());
        assert!(check_set("user.LFS.Too.Deep", "x").is_err());

        assert!(check_remove("user.color").is_ok());
        assert!(check_remove(XATTR_POLICY).is_err());
        assert!(check_remove(XATTR_INTERLEAVE).is_err());
    }

    #[test]
    fn interleave_bytes() {
        let (_topo, mut store) = fixture();
        let shelf = store.create_shelf("xyzzy", 0).unwrap();
        for (seq, (ig, num)) in [(1u8, 0u64), (0, 2), (11, 4)].iter().enumerate() {
            store
                .create_bos(crate::books::Bos {
                    shelf_id: shelf.id,
                    book_id: lza(*ig, *num),
                    seq_num: seq as u64 + 1,
                })
                .unwrap();
        }
        let shelf = store
            .get_shelf(ShelfMatch::Name("xyzzy"))
            .unwrap()
            .unwrap();
        let v = special_get(&mut store, &shelf, XATTR_INTERLEAVE)
            .unwrap()
            .unwrap();
        assert_eq!(v.as_bytes(), &[1, 0, 11]);
    }
}
