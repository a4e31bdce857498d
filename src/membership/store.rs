// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::error::Result;
use crate::types::{MemberInfo, NodeId, RealmId};
use std::path::Path;

/// Optional on-disk copy of the member map. One sled tree per realm; recovery seeds the
/// in-memory map at start. Nothing else is persisted by the realm core.
pub(crate) struct MemberStore {
    tree: sled::Tree,
}

impl MemberStore {
    /// Opens (or creates) the store under `dir` for `realm`.
    pub(crate) fn open(dir: &Path, realm: &RealmId) -> Result<Self> {
        let db = sled::open(dir.join("realm_members"))?;
        let tree = db.open_tree(realm.as_str())?;
        Ok(Self { tree })
    }

    pub(crate) fn load_all(&self) -> Result<Vec<MemberInfo>> {
        let mut members = Vec::new();
        for entry in self.tree.iter() {
            let (_, value) = entry?;
            match bincode::deserialize::<MemberInfo>(&value) {
                Ok(info) => members.push(info),
                Err(err) => warn!("skipping undecodable member record: {}", err),
            }
        }
        Ok(members)
    }

    pub(crate) fn put(&self, info: &MemberInfo) -> Result<()> {
        let _ = self
            .tree
            .insert(info.peer.as_bytes(), bincode::serialize(info)?)?;
        Ok(())
    }

    pub(crate) fn remove(&self, peer: &NodeId) -> Result<()> {
        let _ = self.tree.remove(peer.as_bytes())?;
        Ok(())
    }
}

impl std::fmt::Debug for MemberStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberStore")
            .field("records", &self.tree.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn records_survive_reopen() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let realm = RealmId::new("r")?;
        let keypair = ed25519_dalek::Keypair::generate(&mut OsRng);
        let peer = NodeId::from_public_key(&keypair.public);
        let info = MemberInfo::joined(peer.clone(), realm.clone(), vec![]);

        {
            let store = MemberStore::open(dir.path(), &realm)?;
            store.put(&info)?;
        }

        let store = MemberStore::open(dir.path(), &realm)?;
        let loaded = store.load_all()?;
        assert_eq!(loaded, vec![info]);

        store.remove(&peer)?;
        assert!(store.load_all()?.is_empty());
        Ok(())
    }
}
