//! Initial migration creating the sync-pair tables

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Node::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Node::DbId)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Node::ParentDbId).big_integer())
                    .col(ColumnDef::new(Node::LocalId).string().unique_key())
                    .col(ColumnDef::new(Node::RemoteId).string().unique_key())
                    .col(ColumnDef::new(Node::LocalName).string().not_null())
                    .col(ColumnDef::new(Node::RemoteName).string().not_null())
                    .col(ColumnDef::new(Node::Kind).integer().not_null())
                    .col(ColumnDef::new(Node::Size).big_integer().not_null().default(0))
                    .col(ColumnDef::new(Node::CreatedAtLocal).big_integer())
                    .col(ColumnDef::new(Node::CreatedAtRemote).big_integer())
                    .col(ColumnDef::new(Node::LastModLocal).big_integer())
                    .col(ColumnDef::new(Node::LastModRemote).big_integer())
                    .col(ColumnDef::new(Node::Checksum).string())
                    .col(
                        ColumnDef::new(Node::Syncing)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_node_parent")
                            .from(Node::Table, Node::ParentDbId)
                            .to(Node::Table, Node::DbId)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // One live name per parent and side
        manager
            .create_index(
                Index::create()
                    .name("idx_node_parent_local_name")
                    .table(Node::Table)
                    .col(Node::ParentDbId)
                    .col(Node::LocalName)
                    .unique()
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_node_parent_remote_name")
                    .table(Node::Table)
                    .col(Node::ParentDbId)
                    .col(Node::RemoteName)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(SyncNode::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncNode::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncNode::NodeId).string().not_null())
                    .col(ColumnDef::new(SyncNode::Side).integer().not_null())
                    .col(ColumnDef::new(SyncNode::Kind).integer().not_null())
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_sync_node_unique")
                    .table(SyncNode::Table)
                    .col(SyncNode::NodeId)
                    .col(SyncNode::Side)
                    .col(SyncNode::Kind)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(AppState::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(AppState::Key).string().not_null().primary_key())
                    .col(ColumnDef::new(AppState::Value).string().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(SelectiveSync::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SelectiveSync::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SelectiveSync::Path).string().not_null().unique_key())
                    .col(
                        ColumnDef::new(SelectiveSync::Excluded)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SelectiveSync::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AppState::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SyncNode::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Node::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(Iden)]
enum Node {
    Table,
    DbId,
    ParentDbId,
    LocalId,
    RemoteId,
    LocalName,
    RemoteName,
    Kind,
    Size,
    CreatedAtLocal,
    CreatedAtRemote,
    LastModLocal,
    LastModRemote,
    Checksum,
    Syncing,
}

#[derive(Iden)]
enum SyncNode {
    Table,
    Id,
    NodeId,
    Side,
    Kind,
}

#[derive(Iden)]
enum AppState {
    Table,
    Key,
    Value,
}

#[derive(Iden)]
enum SelectiveSync {
    Table,
    Id,
    Path,
    Excluded,
}
