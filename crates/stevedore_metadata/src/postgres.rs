use async_trait::async_trait;
use sea_query::{Expr, Iden, OnConflict, Order, PostgresQueryBuilder, Query, Value};
use sea_query_binder::SqlxBinder;
use serde::Deserialize;
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::types::Json;
use sqlx::{Pool, Row};

use stevedore_core::records::{
    Blob, BlobRecords, Repository, RepositoryRecords, Tag, TagRecords,
};
use stevedore_core::{OciDigest, RepositoryName};

use super::errors::Result;

#[derive(Clone, Debug, Deserialize)]
pub struct PostgresConfig {
    connection_string: String,
}

impl PostgresConfig {
    /// Connect and bring the schema up to date.
    pub async fn new_records(&self) -> Result<PostgresRecords> {
        let pool = PgPoolOptions::new()
            .connect(&self.connection_string)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(PostgresRecords { pool })
    }
}

#[derive(Iden)]
enum Blobs {
    Table,
    Digest,
    Path,
    Size,
    RefCount,
}

#[derive(Iden)]
enum Tags {
    Table,
    Namespace,
    Repository,
    Tag,
    ImageId,
    Manifest,
    Schema,
    Digest,
    Memo,
    Reference,
    Created,
    Updated,
}

#[derive(Iden)]
enum Repositories {
    Table,
    Namespace,
    Repository,
    Tags,
    Images,
    Agent,
    ApiVersion,
    Created,
    Updated,
}

fn decode_error(index: &str, e: impl std::fmt::Display) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: index.to_string(),
        source: format!("{e}").into(),
    }
}

fn digest_column(row: &sqlx_postgres::PgRow, index: &str) -> sqlx::Result<OciDigest> {
    OciDigest::try_from(row.try_get::<String, _>(index)?).map_err(|e| decode_error(index, e))
}

fn name_columns(row: &sqlx_postgres::PgRow) -> sqlx::Result<RepositoryName> {
    let namespace: String = row.try_get("namespace")?;
    let repository: String = row.try_get("repository")?;
    RepositoryName::new(&namespace, &repository).map_err(|e| decode_error("repository", e))
}

struct BlobRow(Blob);

impl sqlx::FromRow<'_, sqlx_postgres::PgRow> for BlobRow {
    fn from_row(row: &sqlx_postgres::PgRow) -> sqlx::Result<Self> {
        Ok(Self(Blob {
            digest: digest_column(row, "digest")?,
            path: row.try_get("path")?,
            size: row.try_get::<i64, _>("size")? as u64,
            ref_count: row.try_get::<i64, _>("ref_count")? as u64,
        }))
    }
}

struct TagRow(Tag);

impl sqlx::FromRow<'_, sqlx_postgres::PgRow> for TagRow {
    fn from_row(row: &sqlx_postgres::PgRow) -> sqlx::Result<Self> {
        Ok(Self(Tag {
            name: name_columns(row)?,
            tag: row.try_get("tag")?,
            image_id: row.try_get("image_id")?,
            manifest: row.try_get("manifest")?,
            schema: row.try_get::<i16, _>("schema")? as u8,
            digest: digest_column(row, "digest")?,
            memo: row.try_get("memo")?,
            reference: row.try_get("reference")?,
            created: row.try_get("created")?,
            updated: row.try_get("updated")?,
        }))
    }
}

struct RepositoryRow(Repository);

impl sqlx::FromRow<'_, sqlx_postgres::PgRow> for RepositoryRow {
    fn from_row(row: &sqlx_postgres::PgRow) -> sqlx::Result<Self> {
        Ok(Self(Repository {
            name: name_columns(row)?,
            tags: row.try_get::<Json<Vec<String>>, _>("tags")?.0,
            images: row.try_get::<Json<Vec<String>>, _>("images")?.0,
            agent: row.try_get("agent")?,
            api_version: row.try_get("api_version")?,
            created: row.try_get("created")?,
            updated: row.try_get("updated")?,
        }))
    }
}

/// Record store backed by a postgres connection pool.
#[derive(Clone)]
pub struct PostgresRecords {
    pool: Pool<Postgres>,
}

impl PostgresRecords {
    /// Insert `tag`. An existing row is overwritten when `overwrite` is set and is a
    /// [`Error::Conflict`](super::Error::Conflict) otherwise.
    async fn write_tag(&self, tag: &Tag, overwrite: bool) -> Result<()> {
        let mut on_conflict = OnConflict::columns([Tags::Namespace, Tags::Repository, Tags::Tag]);
        if overwrite {
            on_conflict.update_columns([
                Tags::ImageId,
                Tags::Manifest,
                Tags::Schema,
                Tags::Digest,
                Tags::Memo,
                Tags::Reference,
                Tags::Updated,
            ]);
        } else {
            on_conflict.do_nothing();
        }
        let (sql, values) = Query::insert()
            .into_table(Tags::Table)
            .columns([
                Tags::Namespace,
                Tags::Repository,
                Tags::Tag,
                Tags::ImageId,
                Tags::Manifest,
                Tags::Schema,
                Tags::Digest,
                Tags::Memo,
                Tags::Reference,
                Tags::Created,
                Tags::Updated,
            ])
            .values([
                Value::from(tag.name.namespace()).into(),
                Value::from(tag.name.repository()).into(),
                Value::from(tag.tag.as_str()).into(),
                Value::from(tag.image_id.as_str()).into(),
                Value::from(tag.manifest.as_str()).into(),
                Value::from(tag.schema as i16).into(),
                Value::from(String::from(&tag.digest)).into(),
                Value::from(tag.memo.as_str()).into(),
                Value::from(tag.reference.as_str()).into(),
                Value::from(tag.created).into(),
                Value::from(tag.updated).into(),
            ])?
            .on_conflict(on_conflict)
            .build_sqlx(PostgresQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(super::Error::Conflict(format!("tag {}:{}", tag.name, tag.tag)));
        }
        Ok(())
    }

    /// Insert `repository`, overwriting an existing row only when `overwrite` is set.
    async fn write_repository(&self, repository: &Repository, overwrite: bool) -> Result<()> {
        let mut on_conflict =
            OnConflict::columns([Repositories::Namespace, Repositories::Repository]);
        if overwrite {
            on_conflict.update_columns([
                Repositories::Tags,
                Repositories::Images,
                Repositories::Agent,
                Repositories::ApiVersion,
                Repositories::Updated,
            ]);
        } else {
            on_conflict.do_nothing();
        }
        let tags = serde_json::to_value(&repository.tags)?;
        let images = serde_json::to_value(&repository.images)?;
        let (sql, values) = Query::insert()
            .into_table(Repositories::Table)
            .columns([
                Repositories::Namespace,
                Repositories::Repository,
                Repositories::Tags,
                Repositories::Images,
                Repositories::Agent,
                Repositories::ApiVersion,
                Repositories::Created,
                Repositories::Updated,
            ])
            .values([
                Value::from(repository.name.namespace()).into(),
                Value::from(repository.name.repository()).into(),
                Expr::value(tags),
                Expr::value(images),
                Value::from(repository.agent.as_str()).into(),
                Value::from(repository.api_version.as_str()).into(),
                Value::from(repository.created).into(),
                Value::from(repository.updated).into(),
            ])?
            .on_conflict(on_conflict)
            .build_sqlx(PostgresQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(super::Error::Conflict(format!("repository {}", repository.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobRecords for PostgresRecords {
    async fn get_blob(&self, digest: &OciDigest) -> stevedore_core::Result<Option<Blob>> {
        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .columns([Blobs::Digest, Blobs::Path, Blobs::Size, Blobs::RefCount])
            .and_where(Expr::col(Blobs::Digest).eq(String::from(digest)))
            .build_sqlx(PostgresQueryBuilder);

        let row = sqlx::query_as_with::<_, BlobRow, _>(&sql, values)
            .fetch_optional(&self.pool)
            .await
            .map_err(super::Error::from)?;
        Ok(row.map(|r| r.0))
    }

    async fn insert_blob(&self, blob: &Blob) -> stevedore_core::Result<bool> {
        let (sql, values) = Query::insert()
            .into_table(Blobs::Table)
            .columns([Blobs::Digest, Blobs::Path, Blobs::Size, Blobs::RefCount])
            .values([
                Value::from(String::from(&blob.digest)).into(),
                Value::from(blob.path.as_str()).into(),
                Value::from(blob.size as i64).into(),
                Value::from(blob.ref_count as i64).into(),
            ])
            .map_err(super::Error::from)?
            .on_conflict(OnConflict::column(Blobs::Digest).do_nothing().to_owned())
            .build_sqlx(PostgresQueryBuilder);

        let result = sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(super::Error::from)?;
        Ok(result.rows_affected() == 1)
    }

    async fn swap_ref_count(
        &self,
        digest: &OciDigest,
        expected: u64,
        new: u64,
    ) -> stevedore_core::Result<bool> {
        let (sql, values) = Query::update()
            .table(Blobs::Table)
            .value(Blobs::RefCount, new as i64)
            .and_where(Expr::col(Blobs::Digest).eq(String::from(digest)))
            .and_where(Expr::col(Blobs::RefCount).eq(expected as i64))
            .build_sqlx(PostgresQueryBuilder);

        let result = sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(super::Error::from)?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_blob(&self, digest: &OciDigest) -> stevedore_core::Result<()> {
        let (sql, values) = Query::delete()
            .from_table(Blobs::Table)
            .and_where(Expr::col(Blobs::Digest).eq(String::from(digest)))
            .build_sqlx(PostgresQueryBuilder);

        sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(super::Error::from)?;
        Ok(())
    }
}

#[async_trait]
impl TagRecords for PostgresRecords {
    async fn get_tag(&self, name: &RepositoryName, tag: &str) -> stevedore_core::Result<Option<Tag>> {
        let (sql, values) = Query::select()
            .from(Tags::Table)
            .columns([
                Tags::Namespace,
                Tags::Repository,
                Tags::Tag,
                Tags::ImageId,
                Tags::Manifest,
                Tags::Schema,
                Tags::Digest,
                Tags::Memo,
                Tags::Reference,
                Tags::Created,
                Tags::Updated,
            ])
            .and_where(Expr::col(Tags::Namespace).eq(name.namespace()))
            .and_where(Expr::col(Tags::Repository).eq(name.repository()))
            .and_where(Expr::col(Tags::Tag).eq(tag))
            .build_sqlx(PostgresQueryBuilder);

        let row = sqlx::query_as_with::<_, TagRow, _>(&sql, values)
            .fetch_optional(&self.pool)
            .await
            .map_err(super::Error::from)?;
        Ok(row.map(|r| r.0))
    }

    async fn get_tags_by_reference(
        &self,
        name: &RepositoryName,
        reference: &str,
    ) -> stevedore_core::Result<Vec<Tag>> {
        let (sql, values) = Query::select()
            .from(Tags::Table)
            .columns([
                Tags::Namespace,
                Tags::Repository,
                Tags::Tag,
                Tags::ImageId,
                Tags::Manifest,
                Tags::Schema,
                Tags::Digest,
                Tags::Memo,
                Tags::Reference,
                Tags::Created,
                Tags::Updated,
            ])
            .and_where(Expr::col(Tags::Namespace).eq(name.namespace()))
            .and_where(Expr::col(Tags::Repository).eq(name.repository()))
            .and_where(Expr::col(Tags::Reference).eq(reference))
            .order_by(Tags::Tag, Order::Asc)
            .build_sqlx(PostgresQueryBuilder);

        let rows = sqlx::query_as_with::<_, TagRow, _>(&sql, values)
            .fetch_all(&self.pool)
            .await
            .map_err(super::Error::from)?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn insert_tag(&self, tag: &Tag) -> stevedore_core::Result<()> {
        Ok(self.write_tag(tag, false).await?)
    }

    async fn update_tag(&self, tag: &Tag) -> stevedore_core::Result<()> {
        Ok(self.write_tag(tag, true).await?)
    }

    async fn delete_tag(&self, name: &RepositoryName, tag: &str) -> stevedore_core::Result<()> {
        let (sql, values) = Query::delete()
            .from_table(Tags::Table)
            .and_where(Expr::col(Tags::Namespace).eq(name.namespace()))
            .and_where(Expr::col(Tags::Repository).eq(name.repository()))
            .and_where(Expr::col(Tags::Tag).eq(tag))
            .build_sqlx(PostgresQueryBuilder);

        sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(super::Error::from)?;
        Ok(())
    }
}

#[async_trait]
impl RepositoryRecords for PostgresRecords {
    async fn get_repository(
        &self,
        name: &RepositoryName,
    ) -> stevedore_core::Result<Option<Repository>> {
        let (sql, values) = Query::select()
            .from(Repositories::Table)
            .columns([
                Repositories::Namespace,
                Repositories::Repository,
                Repositories::Tags,
                Repositories::Images,
                Repositories::Agent,
                Repositories::ApiVersion,
                Repositories::Created,
                Repositories::Updated,
            ])
            .and_where(Expr::col(Repositories::Namespace).eq(name.namespace()))
            .and_where(Expr::col(Repositories::Repository).eq(name.repository()))
            .build_sqlx(PostgresQueryBuilder);

        let row = sqlx::query_as_with::<_, RepositoryRow, _>(&sql, values)
            .fetch_optional(&self.pool)
            .await
            .map_err(super::Error::from)?;
        Ok(row.map(|r| r.0))
    }

    async fn insert_repository(&self, repository: &Repository) -> stevedore_core::Result<()> {
        Ok(self.write_repository(repository, false).await?)
    }

    async fn update_repository(&self, repository: &Repository) -> stevedore_core::Result<()> {
        Ok(self.write_repository(repository, true).await?)
    }

    async fn delete_repository(&self, name: &RepositoryName) -> stevedore_core::Result<()> {
        let (sql, values) = Query::delete()
            .from_table(Repositories::Table)
            .and_where(Expr::col(Repositories::Namespace).eq(name.namespace()))
            .and_where(Expr::col(Repositories::Repository).eq(name.repository()))
            .build_sqlx(PostgresQueryBuilder);

        sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await
            .map_err(super::Error::from)?;
        Ok(())
    }

    async fn list_repositories(&self) -> stevedore_core::Result<Vec<RepositoryName>> {
        let (sql, values) = Query::select()
            .from(Repositories::Table)
            .columns([Repositories::Namespace, Repositories::Repository])
            .order_by(Repositories::Namespace, Order::Asc)
            .order_by(Repositories::Repository, Order::Asc)
            .build_sqlx(PostgresQueryBuilder);

        let rows = sqlx::query_with(&sql, values)
            .fetch_all(&self.pool)
            .await
            .map_err(super::Error::from)?;
        let names = rows
            .iter()
            .map(name_columns)
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(super::Error::from)?;
        Ok(names)
    }
}
