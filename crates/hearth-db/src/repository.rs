use chrono::{DateTime, Utc};
use hearth_core::error::AppError;
use hearth_core::models::{Property, PropertyFactors};
use hearth_core::traits::{FactorStore, PropertyStore};
use sqlx::{PgPool, Pool, Postgres};

const PROPERTY_COLUMNS: &str = "id, created_at, updated_at, source, external_id, url, \
    country, city, district, address, latitude, longitude, property_type, price, currency, \
    area, rooms, bedrooms, bathrooms, floor, total_floors, year_built, description, images, \
    scraped_at, is_active";

/// `id` and `created_at` are never touched on conflict, so a listing keeps
/// its identity across harvests.
const UPSERT_PROPERTY: &str = r#"
    INSERT INTO properties (
        source, external_id, url, country, city, district, address, latitude, longitude,
        property_type, price, currency, area, rooms, bedrooms, bathrooms, floor, total_floors,
        year_built, description, images, scraped_at, is_active
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
            $19, $20, $21, $22, $23)
    ON CONFLICT (source, external_id) DO UPDATE SET
        url = EXCLUDED.url,
        country = EXCLUDED.country,
        city = EXCLUDED.city,
        district = EXCLUDED.district,
        address = EXCLUDED.address,
        latitude = EXCLUDED.latitude,
        longitude = EXCLUDED.longitude,
        property_type = EXCLUDED.property_type,
        price = EXCLUDED.price,
        currency = EXCLUDED.currency,
        area = EXCLUDED.area,
        rooms = EXCLUDED.rooms,
        bedrooms = EXCLUDED.bedrooms,
        bathrooms = EXCLUDED.bathrooms,
        floor = EXCLUDED.floor,
        total_floors = EXCLUDED.total_floors,
        year_built = EXCLUDED.year_built,
        description = EXCLUDED.description,
        images = EXCLUDED.images,
        scraped_at = EXCLUDED.scraped_at,
        is_active = EXCLUDED.is_active,
        updated_at = NOW()
    RETURNING id, created_at, updated_at, source, external_id, url, country, city, district,
        address, latitude, longitude, property_type, price, currency, area, rooms, bedrooms,
        bathrooms, floor, total_floors, year_built, description, images, scraped_at, is_active
"#;

/// Listing persistence in PostgreSQL.
#[derive(Clone)]
pub struct PgPropertyRepository {
    pool: Pool<Postgres>,
}

impl PgPropertyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert every record in one transaction.
    pub async fn upsert_batch(&self, batch: &[Property]) -> Result<Vec<Property>, AppError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let mut stored = Vec::with_capacity(batch.len());

        for p in batch {
            let row = sqlx::query_as::<_, PropertyRow>(UPSERT_PROPERTY)
                .bind(&p.source)
                .bind(&p.external_id)
                .bind(&p.url)
                .bind(&p.country)
                .bind(&p.city)
                .bind(&p.district)
                .bind(&p.address)
                .bind(p.latitude)
                .bind(p.longitude)
                .bind(&p.property_type)
                .bind(p.price)
                .bind(&p.currency)
                .bind(p.area)
                .bind(p.rooms)
                .bind(p.bedrooms)
                .bind(p.bathrooms)
                .bind(p.floor)
                .bind(p.total_floors)
                .bind(p.year_built)
                .bind(&p.description)
                .bind(p.images.as_slice())
                .bind(p.scraped_at)
                .bind(p.is_active)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_error)?;
            stored.push(row.into());
        }

        tx.commit().await.map_err(db_error)?;
        tracing::debug!(count = stored.len(), "Upserted listings");
        Ok(stored)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Property>, AppError> {
        let row = sqlx::query_as::<_, PropertyRow>(&format!(
            "SELECT {PROPERTY_COLUMNS} FROM properties WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(Into::into))
    }

    pub async fn find_by_key(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<Property>, AppError> {
        let row = sqlx::query_as::<_, PropertyRow>(&format!(
            "SELECT {PROPERTY_COLUMNS} FROM properties WHERE source = $1 AND external_id = $2"
        ))
        .bind(source)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(Into::into))
    }

    pub async fn count(&self) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM properties")
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(count)
    }

    /// Insert or replace the factors of one listing.
    pub async fn save_factors(&self, factors: &PropertyFactors) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO property_factors (
                property_id, crime_score, transport_score, education_score,
                infrastructure_score, overall_score, details
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (property_id) DO UPDATE SET
                crime_score = EXCLUDED.crime_score,
                transport_score = EXCLUDED.transport_score,
                education_score = EXCLUDED.education_score,
                infrastructure_score = EXCLUDED.infrastructure_score,
                overall_score = EXCLUDED.overall_score,
                details = EXCLUDED.details,
                updated_at = NOW()
            "#,
        )
        .bind(factors.property_id)
        .bind(factors.crime_score)
        .bind(factors.transport_score)
        .bind(factors.education_score)
        .bind(factors.infrastructure_score)
        .bind(factors.overall_score)
        .bind(&factors.details)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    pub async fn find_factors(&self, property_id: i64) -> Result<Option<PropertyFactors>, AppError> {
        let row = sqlx::query_as::<_, FactorsRow>(
            r#"
            SELECT property_id, crime_score, transport_score, education_score,
                   infrastructure_score, overall_score, details
            FROM property_factors
            WHERE property_id = $1
            "#,
        )
        .bind(property_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(Into::into))
    }

    /// Active listings with coordinates, each with its overall score when
    /// factors exist. Input for heatmap aggregation.
    pub async fn heatmap_listings(
        &self,
        city: Option<&str>,
    ) -> Result<Vec<(Property, Option<f64>)>, AppError> {
        let rows = sqlx::query_as::<_, HeatmapRow>(
            r#"
            SELECT p.id, p.created_at, p.updated_at, p.source, p.external_id, p.url,
                   p.country, p.city, p.district, p.address, p.latitude, p.longitude,
                   p.property_type, p.price, p.currency, p.area, p.rooms, p.bedrooms,
                   p.bathrooms, p.floor, p.total_floors, p.year_built, p.description,
                   p.images, p.scraped_at, p.is_active, f.overall_score
            FROM properties p
            LEFT JOIN property_factors f ON f.property_id = p.id
            WHERE p.is_active
              AND NOT (p.latitude = 0 AND p.longitude = 0)
              AND ($1::TEXT IS NULL OR p.city = $1)
            ORDER BY p.id
            "#,
        )
        .bind(city)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.property.into(), row.overall_score))
            .collect())
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

fn db_error(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

// -- Internal row types for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct PropertyRow {
    id: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    source: String,
    external_id: String,
    url: String,
    country: String,
    city: String,
    district: String,
    address: String,
    latitude: f64,
    longitude: f64,
    property_type: String,
    price: f64,
    currency: String,
    area: f64,
    rooms: i32,
    bedrooms: i32,
    bathrooms: i32,
    floor: i32,
    total_floors: i32,
    year_built: i32,
    description: String,
    images: Vec<String>,
    scraped_at: DateTime<Utc>,
    is_active: bool,
}

impl From<PropertyRow> for Property {
    fn from(row: PropertyRow) -> Self {
        Property {
            id: Some(row.id),
            created_at: Some(row.created_at),
            updated_at: Some(row.updated_at),
            source: row.source,
            external_id: row.external_id,
            url: row.url,
            country: row.country,
            city: row.city,
            district: row.district,
            address: row.address,
            latitude: row.latitude,
            longitude: row.longitude,
            property_type: row.property_type,
            price: row.price,
            currency: row.currency,
            area: row.area,
            rooms: row.rooms,
            bedrooms: row.bedrooms,
            bathrooms: row.bathrooms,
            floor: row.floor,
            total_floors: row.total_floors,
            year_built: row.year_built,
            description: row.description,
            images: row.images,
            scraped_at: row.scraped_at,
            is_active: row.is_active,
        }
    }
}

#[derive(sqlx::FromRow)]
struct HeatmapRow {
    #[sqlx(flatten)]
    property: PropertyRow,
    overall_score: Option<f64>,
}

#[derive(sqlx::FromRow)]
struct FactorsRow {
    property_id: i64,
    crime_score: f64,
    transport_score: f64,
    education_score: f64,
    infrastructure_score: f64,
    overall_score: f64,
    details: serde_json::Value,
}

impl From<FactorsRow> for PropertyFactors {
    fn from(row: FactorsRow) -> Self {
        PropertyFactors {
            property_id: row.property_id,
            crime_score: row.crime_score,
            transport_score: row.transport_score,
            education_score: row.education_score,
            infrastructure_score: row.infrastructure_score,
            overall_score: row.overall_score,
            details: row.details,
        }
    }
}

// -- Trait implementation --

impl PropertyStore for PgPropertyRepository {
    async fn upsert_batch(&self, batch: &[Property]) -> Result<Vec<Property>, AppError> {
        PgPropertyRepository::upsert_batch(self, batch).await
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Property>, AppError> {
        PgPropertyRepository::find_by_id(self, id).await
    }
}

impl FactorStore for PgPropertyRepository {
    async fn save_factors(&self, factors: &PropertyFactors) -> Result<(), AppError> {
        PgPropertyRepository::save_factors(self, factors).await
    }

    async fn find_factors(&self, property_id: i64) -> Result<Option<PropertyFactors>, AppError> {
        PgPropertyRepository::find_factors(self, property_id).await
    }
}
