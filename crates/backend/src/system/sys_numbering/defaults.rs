use contracts::system::sys_numbering::{ResetFrequency, SequenceConfig, SequenceKey};

pub const SALES: &str = "sales";
pub const LOGISTICS: &str = "logistics";
pub const MASTER_DATA: &str = "master_data";

/// Встроенные настройки для известных документов и справочников
pub fn domain_default(key: &SequenceKey) -> Option<SequenceConfig> {
    let yearly = |prefix: &str| {
        SequenceConfig::new(key.clone(), prefix)
            .with_template("{prefix}-{year}-{number:0000}")
            .with_reset(ResetFrequency::Yearly)
    };
    let monthly = |prefix: &str| {
        SequenceConfig::new(key.clone(), prefix)
            .with_template("{prefix}-{year}{month}-{number:0000}")
            .with_reset(ResetFrequency::Monthly)
    };
    let catalog = |prefix: &str| {
        let mut cfg = SequenceConfig::new(key.clone(), prefix);
        cfg.number_length = 5;
        cfg
    };

    let config = match (key.domain.as_str(), key.name.as_str()) {
        (SALES, "invoice") => yearly("INV"),
        (SALES, "quote") => yearly("QT"),
        (SALES, "sales_order") => monthly("SO"),
        (SALES, "credit_note") => yearly("CN"),
        (LOGISTICS, "purchase_order") => yearly("PO"),
        (LOGISTICS, "shipment") => SequenceConfig::new(key.clone(), "SHP")
            .with_template("{prefix}-{year}{month}{day}-{number:000}")
            .with_reset(ResetFrequency::Daily),
        (LOGISTICS, "goods_receipt") => monthly("GRN"),
        (LOGISTICS, "delivery_note") => monthly("DN"),
        (MASTER_DATA, "customers") => catalog("CUS"),
        (MASTER_DATA, "suppliers") => catalog("SUP"),
        (MASTER_DATA, "products") => catalog("PRD"),
        (MASTER_DATA, "leads") => catalog("LEAD"),
        _ => return None,
    };
    Some(config)
}

/// `{prefix: KEY, template: "{prefix}-{number:0000}"}` для всего остального
pub fn fallback(key: &SequenceKey) -> SequenceConfig {
    SequenceConfig::new(key.clone(), key.name.to_uppercase()).with_template("{prefix}-{number:0000}")
}

pub fn default_for(key: &SequenceKey) -> SequenceConfig {
    domain_default(key).unwrap_or_else(|| fallback(key))
}
