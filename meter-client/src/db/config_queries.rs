use anyhow::Result;
use sqlx::PgPool;

use crate::domain::{DeviceRegister, Meter, MeterKey, Register, Tenant};

/// Resolve the tenant an API key belongs to.
pub async fn fetch_tenant_by_api_key(pool: &PgPool, api_key: &str) -> Result<Option<Tenant>> {
    let row = sqlx::query_as::<_, Tenant>(
        r#"
        SELECT tenant_id, api_key, download_batch_size, upload_batch_size
        FROM tenants
        WHERE api_key = $1
        "#,
    )
    .bind(api_key)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// The edge store holds a single tenant row.
pub async fn fetch_local_tenant(pool: &PgPool) -> Result<Option<Tenant>> {
    let row = sqlx::query_as::<_, Tenant>(
        r#"
        SELECT tenant_id, api_key, download_batch_size, upload_batch_size
        FROM tenants
        ORDER BY tenant_id
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

pub async fn upsert_tenant(pool: &PgPool, tenant: &Tenant) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tenants (tenant_id, api_key, download_batch_size, upload_batch_size)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (tenant_id) DO UPDATE
        SET api_key = EXCLUDED.api_key,
            download_batch_size = EXCLUDED.download_batch_size,
            upload_batch_size = EXCLUDED.upload_batch_size
        "#,
    )
    .bind(tenant.tenant_id)
    .bind(&tenant.api_key)
    .bind(tenant.download_batch_size)
    .bind(tenant.upload_batch_size)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn delete_tenant(pool: &PgPool, tenant_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM tenants WHERE tenant_id = $1")
        .bind(tenant_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// One page of a tenant's meters, ordered by identity.
pub async fn list_meters_page(
    pool: &PgPool,
    tenant_id: i64,
    limit: i64,
    offset: i64,
) -> Result<Vec<Meter>> {
    let rows = sqlx::query_as::<_, Meter>(
        r#"
        SELECT meter_id, meter_element_id, device_id, name, active, ip, port, element
        FROM meters
        WHERE tenant_id = $1
        ORDER BY meter_id, meter_element_id
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(tenant_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Every meter in the store regardless of tenant. The edge store only holds one tenant's meters.
pub async fn list_all_meters(pool: &PgPool) -> Result<Vec<Meter>> {
    let rows = sqlx::query_as::<_, Meter>(
        r#"
        SELECT meter_id, meter_element_id, device_id, name, active, ip, port, element
        FROM meters
        ORDER BY meter_id, meter_element_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn upsert_meter(pool: &PgPool, tenant_id: i64, meter: &Meter) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO meters (tenant_id, meter_id, meter_element_id, device_id, name, active, ip, port, element)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (meter_id, meter_element_id) DO UPDATE
        SET tenant_id = EXCLUDED.tenant_id,
            device_id = EXCLUDED.device_id,
            name = EXCLUDED.name,
            active = EXCLUDED.active,
            ip = EXCLUDED.ip,
            port = EXCLUDED.port,
            element = EXCLUDED.element
        "#,
    )
    .bind(tenant_id)
    .bind(meter.meter_id)
    .bind(meter.meter_element_id)
    .bind(meter.device_id)
    .bind(&meter.name)
    .bind(meter.active)
    .bind(&meter.ip)
    .bind(meter.port)
    .bind(&meter.element)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn delete_meter(pool: &PgPool, key: MeterKey) -> Result<()> {
    sqlx::query("DELETE FROM meters WHERE meter_id = $1 AND meter_element_id = $2")
        .bind(key.meter_id)
        .bind(key.meter_element_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_registers(pool: &PgPool) -> Result<Vec<Register>> {
    let rows = sqlx::query_as::<_, Register>(
        r#"
        SELECT register_id, name, "register", unit, field_name, scale
        FROM registers
        ORDER BY register_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn upsert_register(pool: &PgPool, register: &Register) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO registers (register_id, name, "register", unit, field_name, scale)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (register_id) DO UPDATE
        SET name = EXCLUDED.name,
            "register" = EXCLUDED."register",
            unit = EXCLUDED.unit,
            field_name = EXCLUDED.field_name,
            scale = EXCLUDED.scale
        "#,
    )
    .bind(register.register_id)
    .bind(&register.name)
    .bind(register.register)
    .bind(&register.unit)
    .bind(&register.field_name)
    .bind(register.scale)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn delete_register(pool: &PgPool, register_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM registers WHERE register_id = $1")
        .bind(register_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_device_registers(pool: &PgPool) -> Result<Vec<DeviceRegister>> {
    let rows = sqlx::query_as::<_, DeviceRegister>(
        r#"
        SELECT device_register_id, device_id, register_id
        FROM device_registers
        ORDER BY device_register_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn upsert_device_register(pool: &PgPool, row: &DeviceRegister) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO device_registers (device_register_id, device_id, register_id)
        VALUES ($1, $2, $3)
        ON CONFLICT (device_register_id) DO UPDATE
        SET device_id = EXCLUDED.device_id,
            register_id = EXCLUDED.register_id
        "#,
    )
    .bind(row.device_register_id)
    .bind(row.device_id)
    .bind(row.register_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn delete_device_register(pool: &PgPool, device_register_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM device_registers WHERE device_register_id = $1")
        .bind(device_register_id)
        .execute(pool)
        .await?;
    Ok(())
}
