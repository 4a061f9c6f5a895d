//! Accounts registered by extensions.

use soundtime_ext_core::AccountDetails;

#[derive(Debug, Default)]
pub struct AccountStore {
    accounts: Vec<AccountDetails>,
}

impl AccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the account `(package_name, account.id)`.
    pub fn upsert(&mut self, package_name: &str, mut account: AccountDetails) {
        account.package_name = package_name.to_string();
        match self
            .accounts
            .iter_mut()
            .find(|a| a.package_name == package_name && a.id == account.id)
        {
            Some(existing) => *existing = account,
            None => self.accounts.push(account),
        }
    }

    pub fn remove(&mut self, package_name: &str, id: &str) -> bool {
        let before = self.accounts.len();
        self.accounts
            .retain(|a| !(a.package_name == package_name && a.id == id));
        self.accounts.len() != before
    }

    pub fn remove_all(&mut self, package_name: &str) {
        self.accounts.retain(|a| a.package_name != package_name);
    }

    pub fn list<F>(&self, owner_ok: F) -> Vec<AccountDetails>
    where
        F: Fn(&str) -> bool,
    {
        self.accounts
            .iter()
            .filter(|a| owner_ok(&a.package_name))
            .cloned()
            .collect()
    }

    pub fn contains(&self, package_name: &str, id: &str) -> bool {
        self.accounts
            .iter()
            .any(|a| a.package_name == package_name && a.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str, name: &str) -> AccountDetails {
        AccountDetails {
            id: id.into(),
            package_name: "spoofed".into(),
            name: name.into(),
            bg_color: None,
            icon: None,
            logged_in: false,
            username: None,
        }
    }

    #[test]
    fn test_upsert_stamps_owner_and_replaces() {
        let mut store = AccountStore::new();
        store.upsert("demo-ext", account("main", "Demo"));
        store.upsert("demo-ext", account("main", "Demo renamed"));
        store.upsert("other-ext", account("main", "Other"));

        let all = store.list(|_| true);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].package_name, "demo-ext");
        assert_eq!(all[0].name, "Demo renamed");
        assert!(store.contains("other-ext", "main"));
    }

    #[test]
    fn test_remove_is_owner_scoped() {
        let mut store = AccountStore::new();
        store.upsert("demo-ext", account("main", "Demo"));
        assert!(!store.remove("other-ext", "main"));
        assert!(store.remove("demo-ext", "main"));
        assert!(store.list(|_| true).is_empty());
    }

    #[test]
    fn test_list_filter_and_remove_all() {
        let mut store = AccountStore::new();
        store.upsert("a-ext", account("1", "A"));
        store.upsert("b-ext", account("1", "B"));
        assert_eq!(store.list(|owner| owner == "b-ext")[0].name, "B");
        store.remove_all("a-ext");
        assert_eq!(store.list(|_| true).len(), 1);
    }
}
