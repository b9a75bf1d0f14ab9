//! Node entity: one row per synchronized object

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "node")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub db_id: i64,
    /// `None` for the sync root only.
    pub parent_db_id: Option<i64>,
    #[sea_orm(unique)]
    pub local_id: Option<String>,
    #[sea_orm(unique)]
    pub remote_id: Option<String>,
    pub local_name: String,
    pub remote_name: String,
    pub kind: i32, // 0=File, 1=Directory, 2=Symlink
    pub size: i64,
    pub created_at_local: Option<i64>,
    pub created_at_remote: Option<i64>,
    pub last_mod_local: Option<i64>,
    pub last_mod_remote: Option<i64>,
    pub checksum: Option<String>,
    pub syncing: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "Entity",
        from = "Column::ParentDbId",
        to = "Column::DbId"
    )]
    Parent,
}

impl ActiveModelBehavior for ActiveModel {}
