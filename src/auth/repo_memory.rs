use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::repo::{RepoError, RepoResult, UserRepo};
use crate::auth::repo_types::{NewUser, User, UserFilter};
use crate::errors::IdentityField;

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    by_username: HashMap<String, Uuid>,
    by_email: HashMap<String, Uuid>,
}

/// Process-local store. The uniqueness check and the insert happen under one
/// write lock, so racing inserts on the same key cannot both succeed.
#[derive(Default)]
pub struct MemoryUserRepo {
    tables: RwLock<Tables>,
}

impl MemoryUserRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.users.len()
    }
}

#[async_trait]
impl UserRepo for MemoryUserRepo {
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<User>> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> RepoResult<Option<User>> {
        let t = self.tables.read().await;
        Ok(t.by_username
            .get(username)
            .and_then(|id| t.users.get(id))
            .cloned())
    }

    async fn find_by_email(&self, email: &str) -> RepoResult<Option<User>> {
        let t = self.tables.read().await;
        Ok(t.by_email.get(email).and_then(|id| t.users.get(id)).cloned())
    }

    async fn insert_unique(&self, user: NewUser) -> RepoResult<User> {
        let mut t = self.tables.write().await;
        if t.by_username.contains_key(&user.username) {
            return Err(RepoError::Conflict(IdentityField::Username));
        }
        if t.by_email.contains_key(&user.email) {
            return Err(RepoError::Conflict(IdentityField::Email));
        }
        if t.users.contains_key(&user.id) {
            return Err(RepoError::Backend(format!("duplicate id {}", user.id)));
        }
        let user = user.into_user();
        t.by_username.insert(user.username.clone(), user.id);
        t.by_email.insert(user.email.clone(), user.id);
        t.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn list(&self, filter: &UserFilter) -> RepoResult<Vec<User>> {
        let needle = filter.search.as_deref().map(str::to_lowercase);
        let t = self.tables.read().await;
        let mut users: Vec<User> = t
            .users
            .values()
            .filter(|u| match &needle {
                Some(n) => {
                    u.username.to_lowercase().contains(n.as_str())
                        || u.email.to_lowercase().contains(n.as_str())
                }
                None => true,
            })
            .cloned()
            .collect();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(users
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        updated_at: OffsetDateTime,
    ) -> RepoResult<Option<User>> {
        let mut t = self.tables.write().await;
        Ok(t.users.get_mut(&id).map(|u| {
            u.password_hash = password_hash.to_string();
            u.updated_at = updated_at;
            u.clone()
        }))
    }

    async fn set_active(
        &self,
        id: Uuid,
        active: bool,
        updated_at: OffsetDateTime,
    ) -> RepoResult<Option<User>> {
        let mut t = self.tables.write().await;
        Ok(t.users.get_mut(&id).map(|u| {
            u.is_active = active;
            u.updated_at = updated_at;
            u.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::*;
    use crate::auth::repo_types::ROLE_USER;

    fn new_user(username: &str, email: &str) -> NewUser {
        NewUser {
            id: Uuid::new_v4(),
            username: username.into(),
            email: email.into(),
            password_hash: "hash".into(),
            roles: BTreeSet::from([ROLE_USER.to_string()]),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn insert_then_find_by_each_key() {
        let repo = MemoryUserRepo::new();
        let user = repo
            .insert_unique(new_user("alice", "alice@x.com"))
            .await
            .expect("insert");

        let by_name = repo.find_by_username("alice").await.unwrap().unwrap();
        let by_email = repo.find_by_email("alice@x.com").await.unwrap().unwrap();
        let by_id = repo.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(by_name.id, user.id);
        assert_eq!(by_email.id, user.id);
        assert_eq!(by_id.id, user.id);
        assert!(repo.find_by_username("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conflicts_name_the_field_and_write_nothing() {
        let repo = MemoryUserRepo::new();
        repo.insert_unique(new_user("alice", "alice@x.com"))
            .await
            .unwrap();

        let err = repo
            .insert_unique(new_user("alice", "other@x.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Conflict(IdentityField::Username)));

        let err = repo
            .insert_unique(new_user("bob", "alice@x.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Conflict(IdentityField::Email)));

        assert_eq!(repo.len().await, 1);
        assert!(repo.find_by_email("other@x.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_and_pages_newest_first() {
        let repo = MemoryUserRepo::new();
        let mut older = new_user("alice", "alice@x.com");
        older.created_at -= time::Duration::minutes(5);
        repo.insert_unique(older).await.unwrap();
        repo.insert_unique(new_user("bob", "bob@school.edu"))
            .await
            .unwrap();
        repo.insert_unique(new_user("Alicia", "ally@school.edu"))
            .await
            .unwrap();

        let all = repo
            .list(&UserFilter {
                search: None,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all.last().unwrap().username, "alice");

        let ali = repo
            .list(&UserFilter {
                search: Some("ALI".into()),
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(ali.len(), 2);

        let page = repo
            .list(&UserFilter {
                search: None,
                limit: 1,
                offset: 2,
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].username, "alice");
    }

    #[tokio::test]
    async fn updates_bump_updated_at() {
        let repo = MemoryUserRepo::new();
        let user = repo
            .insert_unique(new_user("alice", "alice@x.com"))
            .await
            .unwrap();
        let later = user.updated_at + time::Duration::seconds(1);

        let updated = repo
            .update_password(user.id, "new-hash", later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.password_hash, "new-hash");
        assert_eq!(updated.updated_at, later);
        assert_eq!(updated.created_at, user.created_at);

        let deactivated = repo.set_active(user.id, false, later).await.unwrap().unwrap();
        assert!(!deactivated.is_active);
        assert!(repo
            .set_active(Uuid::new_v4(), false, later)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_inserts_admit_exactly_one() {
        let repo = Arc::new(MemoryUserRepo::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.insert_unique(new_user("racer", &format!("racer{i}@x.com")))
                    .await
            }));
        }
        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(RepoError::Conflict(IdentityField::Username)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(repo.len().await, 1);
    }
}
