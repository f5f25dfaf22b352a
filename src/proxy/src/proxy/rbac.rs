// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Role and privilege handlers.
//!
//! Roles, memberships and grants are stored by the metadata authority;
//! these handlers validate and forward. Changes this front-end makes are
//! applied to its own policy cache right away. Other front-ends learn of
//! them through `refresh_policy_info_cache`.

use tracing::info;

use crate::error::ProxyError;
use crate::proxy::Proxy;
use crate::task::validate_name;
use crate::types::{
    Grant, GrantObject, PolicyRefresh, PrivilegeOp, RoleResult, UserResult, UserRoleOp,
    DEFAULT_ROLES, OBJECT_TYPES,
};

fn validate_object(object: &GrantObject) -> Result<(), ProxyError> {
    if !OBJECT_TYPES.contains(&object.object_type.as_str()) {
        return Err(ProxyError::InvalidRequest(format!(
            "invalid object type {:?}, expected one of {OBJECT_TYPES:?}",
            object.object_type
        )));
    }
    if object.object_name.is_empty() {
        return Err(ProxyError::InvalidRequest("object name must be set".into()));
    }
    Ok(())
}

fn validate_grant(grant: &Grant) -> Result<(), ProxyError> {
    validate_name("privilege", &grant.privilege)?;
    validate_object(&grant.object)?;
    validate_name("role", &grant.role)?;
    if grant.grantor.is_empty() {
        return Err(ProxyError::InvalidRequest("grantor must be set".into()));
    }
    Ok(())
}

impl Proxy {
    pub async fn create_role(&self, role: &str) -> Result<(), ProxyError> {
        self.run_direct("CreateRole", async {
            validate_name("role", role)?;
            self.backends.metadata.create_role(role).await?;
            info!(role, "created role");
            Ok(())
        })
        .await
    }

    /// Drops a role with its grants and memberships. The default roles
    /// cannot be dropped.
    pub async fn drop_role(&self, role: &str) -> Result<(), ProxyError> {
        self.run_direct("DropRole", async {
            validate_name("role", role)?;
            if DEFAULT_ROLES.contains(&role) {
                return Err(ProxyError::InvalidRequest(format!(
                    "the default role {role} cannot be dropped"
                )));
            }
            self.backends.metadata.drop_role(role).await?;
            self.env.meta_cache.refresh_policy(PolicyRefresh::DeleteRole {
                role: role.to_owned(),
            });
            info!(role, "dropped role");
            Ok(())
        })
        .await
    }

    pub async fn operate_user_role(
        &self,
        user: &str,
        role: &str,
        op: UserRoleOp,
    ) -> Result<(), ProxyError> {
        self.run_direct("OperateUserRole", async {
            validate_name("user", user)?;
            validate_name("role", role)?;
            self.backends
                .metadata
                .operate_user_role(user, role, op)
                .await?;
            let (user, role) = (user.to_owned(), role.to_owned());
            self.env.meta_cache.refresh_policy(match op {
                UserRoleOp::AddUserToRole => PolicyRefresh::AddUserToRole { user, role },
                UserRoleOp::RemoveUserFromRole => PolicyRefresh::RemoveUserFromRole { user, role },
            });
            Ok(())
        })
        .await
    }

    /// Lists `role`, or every role. Members are included on request.
    pub async fn select_role(
        &self,
        role: Option<&str>,
        include_users: bool,
    ) -> Result<Vec<RoleResult>, ProxyError> {
        self.run_direct("SelectRole", async {
            if let Some(role) = role {
                validate_name("role", role)?;
            }
            Ok(self
                .backends
                .metadata
                .select_role(role, include_users)
                .await?)
        })
        .await
    }

    /// Lists `user`, or every user. Roles are included on request.
    pub async fn select_user(
        &self,
        user: Option<&str>,
        include_roles: bool,
    ) -> Result<Vec<UserResult>, ProxyError> {
        self.run_direct("SelectUser", async {
            if let Some(user) = user {
                validate_name("user", user)?;
            }
            Ok(self
                .backends
                .metadata
                .select_user(user, include_roles)
                .await?)
        })
        .await
    }

    /// Grants or revokes a privilege. `grant.grantor` is the
    /// authenticated caller.
    pub async fn operate_privilege(&self, grant: Grant, op: PrivilegeOp) -> Result<(), ProxyError> {
        self.run_direct("OperatePrivilege", async {
            validate_grant(&grant)?;
            let (role, policy) = (grant.role.clone(), grant.policy());
            self.backends
                .metadata
                .operate_privilege(grant, op)
                .await?;
            info!(%role, %policy, ?op, "privilege updated");
            self.env.meta_cache.refresh_policy(match op {
                PrivilegeOp::Grant => PolicyRefresh::Grant { role, policy },
                PrivilegeOp::Revoke => PolicyRefresh::Revoke { role, policy },
            });
            Ok(())
        })
        .await
    }

    /// The grants of `role`, optionally only those on `object`.
    pub async fn select_grant(
        &self,
        role: &str,
        object: Option<&GrantObject>,
    ) -> Result<Vec<Grant>, ProxyError> {
        self.run_direct("SelectGrant", async {
            validate_name("role", role)?;
            if let Some(object) = object {
                validate_object(object)?;
            }
            Ok(self.backends.metadata.select_grant(role, object).await?)
        })
        .await
    }
}
