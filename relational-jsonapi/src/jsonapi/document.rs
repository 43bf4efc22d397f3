//! Assembly of JSON:API documents.
//!
//! An [`Assembler`] turns instances loaded from a [`DataSource`] into resource objects, loading
//! the linkage of their relationships in one batch per relationship, and wraps them in a
//! [`Document`] with top-level links and metadata. Resource objects are rendered by a
//! [`Serializer`], which can be overridden per type.

use super::{backend::DataSource, error::Error, error::ErrorObject, page::PageResult};
use crate::schema::{EntityType, Identifier, Instance, Relationship, Schema, Value};
use serde::Serialize;
use serde_json::{json, Map, Value as Json};
use snafu::Snafu;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use url::Url;

/// Sparse fieldsets requested by a client, by type.
pub type Fieldsets = HashMap<String, HashSet<String>>;

/// A resource could not be rendered.
#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
#[snafu(display("Failed to serialize {resource}: {message}"))]
pub struct SerializationError {
    pub resource: Identifier,
    pub message: String,
}

/// The targets of one relationship of one resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Linkage {
    ToOne(Option<Identifier>),
    ToMany(Vec<Identifier>),
}

impl Linkage {
    /// Parse resource linkage for `rel` from the `data` member of a request body.
    ///
    /// The shape must match the cardinality of the relationship and every identifier must name
    /// the relationship's target type.
    pub fn parse(rel: &Relationship, data: &Json) -> Result<Self, Error> {
        match (rel.is_to_many(), data) {
            (false, Json::Null) => Ok(Self::ToOne(None)),
            (false, Json::Object(_)) => Ok(Self::ToOne(Some(parse_identifier(rel, data)?))),
            (true, Json::Array(items)) => Ok(Self::ToMany(
                items
                    .iter()
                    .map(|item| parse_identifier(rel, item))
                    .collect::<Result<_, _>>()?,
            )),
            (true, _) => Err(Error::bad_request(format!(
                "Relationship {} is to-many; its linkage must be a list of resource identifiers",
                rel.name()
            ))),
            (false, _) => Err(Error::bad_request(format!(
                "Relationship {} is to-one; its linkage must be a resource identifier or null",
                rel.name()
            ))),
        }
    }

    /// Build the linkage of `rel` from its loaded targets.
    pub fn from_targets<'a>(
        rel: &Relationship,
        targets: impl IntoIterator<Item = &'a Instance>,
    ) -> Self {
        let mut ids = targets.into_iter().map(|t| t.identifier().clone());
        if rel.is_to_many() {
            Self::ToMany(ids.collect())
        } else {
            Self::ToOne(ids.next())
        }
    }

    pub fn identifiers(&self) -> &[Identifier] {
        match self {
            Self::ToOne(id) => id.as_slice(),
            Self::ToMany(ids) => ids,
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Self::ToOne(None) => Json::Null,
            Self::ToOne(Some(id)) => json!(id),
            Self::ToMany(ids) => json!(ids),
        }
    }
}

fn parse_identifier(rel: &Relationship, item: &Json) -> Result<Identifier, Error> {
    let ty = item.get("type").and_then(Json::as_str);
    let id = match item.get("id") {
        Some(Json::String(id)) => Some(id.clone()),
        Some(Json::Number(id)) => Some(id.to_string()),
        _ => None,
    };
    let (Some(ty), Some(id)) = (ty, id) else {
        return Err(Error::bad_request(
            "Resource identifier objects must have \"type\" and \"id\" members",
        ));
    };
    if ty != rel.target() {
        return Err(Error::conflict(format!(
            "Type must be {}, not {ty}",
            rel.target()
        )));
    }
    Ok(Identifier::new(ty, id))
}

/// Everything a [`Serializer`] needs to render one resource object.
#[derive(Clone, Debug)]
pub struct Resource<'a> {
    pub ty: &'a EntityType,
    pub instance: &'a Instance,
    /// The relationships to render, with their linkage.
    ///
    /// Hidden relationships and those excluded by a sparse fieldset are already left out.
    pub relationships: Vec<(&'a Relationship, Linkage)>,
    /// The sparse fieldset requested for this type, if any.
    pub fieldset: Option<&'a HashSet<String>>,
    /// The fields the server exposes for this type.
    pub visibility: &'a Visibility,
    /// The canonical URL of the resource.
    pub url: String,
}

impl<'a> Resource<'a> {
    /// Should the field or relationship `name` be rendered?
    pub fn includes(&self, name: &str) -> bool {
        self.visibility.exposes(name) && self.fieldset.map_or(true, |fields| fields.contains(name))
    }

    fn error(&self, message: impl Into<String>) -> SerializationError {
        SerializationError {
            resource: self.instance.identifier().clone(),
            message: message.into(),
        }
    }
}

/// Which fields and relationships of a type are ever rendered.
///
/// This is a server-side restriction. Sparse fieldsets requested by clients narrow it further.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Visibility {
    #[default]
    All,
    Only(HashSet<String>),
    Exclude(HashSet<String>),
}

impl Visibility {
    pub fn exposes(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(fields) => fields.contains(name),
            Self::Exclude(fields) => !fields.contains(name),
        }
    }
}

/// Renders resources as JSON:API resource objects.
pub trait Serializer: Debug + Send + Sync {
    fn serialize(&self, resource: &Resource) -> Result<Json, SerializationError>;
}

/// The standard rendering of resource objects.
///
/// Attributes are every field except the ID, rendered by [`Value::to_json`]. Each relationship
/// carries its linkage along with `self` and `related` links. The resource's own `links` member is
/// left out when a sparse fieldset applies to its type.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultSerializer;

impl Serializer for DefaultSerializer {
    fn serialize(&self, resource: &Resource) -> Result<Json, SerializationError> {
        let mut object = Map::new();
        object.insert("id".into(), resource.instance.id().into());
        object.insert("type".into(), resource.ty.name().into());

        let mut attributes = Map::new();
        for field in resource.ty.attributes() {
            if !resource.includes(field.name()) {
                continue;
            }
            let value = resource.instance.get(field.name()).unwrap_or(&Value::Null);
            let json = value.to_json().ok_or_else(|| {
                resource.error(format!("{} has no JSON representation", field.name()))
            })?;
            attributes.insert(field.name().into(), json);
        }
        if !attributes.is_empty() {
            object.insert("attributes".into(), attributes.into());
        }

        let relationships = resource
            .relationships
            .iter()
            .map(|(rel, linkage)| {
                (
                    rel.name().to_string(),
                    json!({
                        "data": linkage.to_json(),
                        "links": {
                            "self": format!("{}/relationships/{}", resource.url, rel.name()),
                            "related": format!("{}/{}", resource.url, rel.name()),
                        },
                    }),
                )
            })
            .collect::<Map<_, _>>();
        if !relationships.is_empty() {
            object.insert("relationships".into(), relationships.into());
        }

        if resource.fieldset.is_none() {
            object.insert("links".into(), json!({ "self": resource.url }));
        }
        Ok(object.into())
    }
}

/// A top-level JSON:API document.
///
/// Exactly one of `data` and `errors` is present.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Document {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ErrorObject>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub included: Option<Vec<Json>>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub links: Map<String, Json>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Json>,
    pub jsonapi: Json,
}

impl Document {
    /// A document with primary data.
    pub fn data(data: Json) -> Self {
        Self {
            data: Some(data),
            errors: None,
            included: None,
            links: Map::new(),
            meta: Map::new(),
            jsonapi: json!({ "version": "1.0" }),
        }
    }

    /// A document reporting an error.
    pub fn errors(err: &Error) -> Self {
        Self {
            data: None,
            errors: Some(err.objects()),
            ..Self::data(Json::Null)
        }
    }

    /// The value of a `Link` header advertising this document's page links.
    pub fn link_header(&self) -> Option<String> {
        let links = ["first", "last", "prev", "next"]
            .into_iter()
            .filter_map(|rel| {
                let url = self.links.get(rel)?.as_str()?;
                Some(format!("<{url}>; rel=\"{rel}\""))
            })
            .collect::<Vec<_>>();
        (!links.is_empty()).then(|| links.join(", "))
    }
}

/// The primary data of a fetch response.
#[derive(Clone, Debug, PartialEq)]
pub enum PrimaryData {
    Resource(Option<Instance>),
    Collection(Vec<Instance>),
}

/// The URL of page `number` of the collection at `url`.
///
/// Every query parameter except `page[number]` is preserved.
pub fn page_url(url: &Url, number: usize) -> Url {
    let pairs = url
        .query_pairs()
        .filter(|(key, _)| key != "page[number]")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect::<Vec<_>>();
    let mut page = url.clone();
    page.query_pairs_mut()
        .clear()
        .extend_pairs(pairs)
        .append_pair("page[number]", &number.to_string());
    page
}

/// Renders instances into documents.
#[derive(Clone, Debug)]
pub struct Assembler {
    schema: Arc<Schema>,
    base_url: String,
    collection_urls: HashMap<String, String>,
    serializers: HashMap<String, Arc<dyn Serializer>>,
    default_serializer: Arc<dyn Serializer>,
    visibility: HashMap<String, Visibility>,
    exposes_all: Visibility,
}

impl Assembler {
    /// An assembler for resources of `schema`, whose collections live under `base_url`.
    pub fn new(schema: Arc<Schema>, base_url: impl Into<String>) -> Self {
        Self {
            schema,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            collection_urls: HashMap::new(),
            serializers: HashMap::new(),
            default_serializer: Arc::new(DefaultSerializer),
            visibility: HashMap::new(),
            exposes_all: Visibility::All,
        }
    }

    /// Serve the collection of type `ty` from `url` instead of the default location.
    pub fn collection_url(mut self, ty: impl Into<String>, url: impl Into<String>) -> Self {
        self.collection_urls.insert(
            ty.into(),
            url.into().trim_end_matches('/').to_string(),
        );
        self
    }

    /// Render resources of type `ty` with `serializer`.
    pub fn serializer(mut self, ty: impl Into<String>, serializer: Arc<dyn Serializer>) -> Self {
        self.serializers.insert(ty.into(), serializer);
        self
    }

    /// Render only the fields of `ty` exposed by `visibility`.
    pub fn visibility(mut self, ty: impl Into<String>, visibility: Visibility) -> Self {
        self.visibility.insert(ty.into(), visibility);
        self
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn url_of_collection(&self, ty: &str) -> String {
        match self.collection_urls.get(ty) {
            Some(url) => url.clone(),
            None => format!("{}/{ty}", self.base_url),
        }
    }

    pub fn url_of_resource(&self, ty: &str, id: &str) -> String {
        format!("{}/{id}", self.url_of_collection(ty))
    }

    /// Render a complete fetch response.
    ///
    /// `included` is rendered into the `included` member if given, even when empty. If `page` is
    /// given, the document carries pagination links built from `url` and the total size of the
    /// collection in `meta`.
    pub async fn assemble<D: DataSource>(
        &self,
        source: &D,
        primary: PrimaryData,
        included: Option<Vec<Instance>>,
        page: Option<&PageResult>,
        url: &Url,
        fieldsets: &Fieldsets,
    ) -> Result<Document, Error> {
        let (instances, single) = match primary {
            PrimaryData::Resource(instance) => (instance.into_iter().collect(), true),
            PrimaryData::Collection(instances) => (instances, false),
        };
        let (mut objects, mut failures) = self.render(source, &instances, fieldsets).await?;
        let included = match included {
            Some(included) => {
                let (included, included_failures) =
                    self.render(source, &included, fieldsets).await?;
                failures.extend(included_failures);
                Some(included)
            }
            None => None,
        };
        if !failures.is_empty() {
            return Err(Error::Serialization {
                failures: failures.iter().map(ToString::to_string).collect(),
            });
        }

        let data = if single {
            objects.pop().unwrap_or(Json::Null)
        } else {
            objects.into()
        };
        let mut doc = Document::data(data);
        doc.included = included;
        doc.links.insert("self".into(), url.as_str().into());
        if let Some(page) = page {
            for (name, number) in page.links() {
                let link = number.map_or(Json::Null, |n| page_url(url, n).as_str().into());
                doc.links.insert(name.into(), link);
            }
            doc.meta.insert("total".into(), page.total.into());
        }
        Ok(doc)
    }

    /// Render a relationship linkage response for `rel` of the resource `ty`/`id`.
    pub fn linkage(&self, ty: &str, id: &str, rel: &Relationship, linkage: &Linkage) -> Document {
        let url = self.url_of_resource(ty, id);
        let mut doc = Document::data(linkage.to_json());
        doc.links.insert(
            "self".into(),
            format!("{url}/relationships/{}", rel.name()).into(),
        );
        doc.links
            .insert("related".into(), format!("{url}/{}", rel.name()).into());
        doc
    }

    /// Render resource objects for `instances`.
    ///
    /// Resources which fail to render are reported individually, so that every failure in a
    /// batch can be reported at once.
    pub async fn render<D: DataSource>(
        &self,
        source: &D,
        instances: &[Instance],
        fieldsets: &Fieldsets,
    ) -> Result<(Vec<Json>, Vec<SerializationError>), Error> {
        // Load linkage for every rendered relationship, one batch per type and relationship.
        let mut owners: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for instance in instances {
            owners
                .entry(instance.ty())
                .or_default()
                .push(instance.id().to_string());
        }
        let mut targets = HashMap::new();
        for (ty, ids) in &owners {
            let Some(ty) = self.schema.entity(ty) else {
                continue;
            };
            for rel in self.relationships(ty, fieldsets) {
                let loaded = source
                    .load_relation(ty, rel, ids)
                    .await
                    .map_err(Error::backend_read)?;
                targets.insert((ty.name(), rel.name()), loaded);
            }
        }

        let mut objects = vec![];
        let mut failures = vec![];
        for instance in instances {
            let Some(ty) = self.schema.entity(instance.ty()) else {
                failures.push(SerializationError {
                    resource: instance.identifier().clone(),
                    message: "unknown type".into(),
                });
                continue;
            };
            let relationships = self
                .relationships(ty, fieldsets)
                .map(|rel| {
                    let loaded = targets
                        .get(&(ty.name(), rel.name()))
                        .and_then(|by_owner| by_owner.get(instance.id()));
                    (rel, Linkage::from_targets(rel, loaded.into_iter().flatten()))
                })
                .collect();
            let resource = Resource {
                ty,
                instance,
                relationships,
                fieldset: fieldsets.get(ty.name()),
                visibility: self.visibility_of(ty.name()),
                url: self.url_of_resource(ty.name(), instance.id()),
            };
            match self.serializer_for(ty.name()).serialize(&resource) {
                Ok(object) => objects.push(object),
                Err(err) => failures.push(err),
            }
        }
        Ok((objects, failures))
    }

    fn relationships<'a>(
        &'a self,
        ty: &'a EntityType,
        fieldsets: &'a Fieldsets,
    ) -> impl Iterator<Item = &'a Relationship> {
        let fieldset = fieldsets.get(ty.name());
        let visibility = self.visibility_of(ty.name());
        ty.relationships().iter().filter(move |rel| {
            visibility.exposes(rel.name())
                && fieldset.map_or(true, |fields| fields.contains(rel.name()))
        })
    }

    fn visibility_of(&self, ty: &str) -> &Visibility {
        self.visibility.get(ty).unwrap_or(&self.exposes_all)
    }

    fn serializer_for(&self, ty: &str) -> &dyn Serializer {
        self.serializers
            .get(ty)
            .unwrap_or(&self.default_serializer)
            .as_ref()
    }
}
