//! Dispatch of JSON:API requests to the protocol engine.
//!
//! [`Api`] implements every JSON:API endpoint for the resource types registered with it. It knows
//! nothing about HTTP itself: a transport converts incoming requests into [`Request`]s and turns
//! the resulting [`Response`]s back into HTTP responses.
//!
//! For a type `person` under the prefix `/api`, the endpoints are
//!
//! | Path                                    | Methods                        |
//! |-----------------------------------------|--------------------------------|
//! | `/api/person`                           | `GET`, `POST`                  |
//! | `/api/person/{id}`                      | `GET`, `PATCH`, `DELETE`       |
//! | `/api/person/{id}/{rel}`                | `GET`                          |
//! | `/api/person/{id}/relationships/{rel}`  | `GET`, `POST`, `PATCH`, `DELETE` |

use super::{
    backend::{DataSource, Query},
    document::{Assembler, Document, Fieldsets, Linkage, PrimaryData, Serializer, Visibility},
    error::Error,
    filter, include, mutate,
    page::paginate,
    params::QueryParams,
    sort,
};
use crate::schema::{EntityType, Instance, Relationship, Schema, Value};
use derivative::Derivative;
use derive_more::Display;
use serde_json::{Map, Value as Json};
use snafu::Snafu;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use url::Url;

/// The media type of JSON:API documents.
pub const MEDIA_TYPE: &str = "application/vnd.api+json";

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    #[display(fmt = "GET")]
    Get,
    #[display(fmt = "POST")]
    Post,
    #[display(fmt = "PATCH")]
    Patch,
    #[display(fmt = "DELETE")]
    Delete,
}

/// A request, as handed over by the transport.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub method: HttpMethod,
    /// The full URL of the request, including the query string.
    pub url: Url,
    /// The parsed request body, if there was one.
    pub body: Option<Json>,
}

impl Request {
    pub fn new(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            body: None,
        }
    }

    pub fn with_body(mut self, body: Json) -> Self {
        self.body = Some(body);
        self
    }

    /// The `data` member of the body.
    fn data(&self) -> Result<&Json, Error> {
        self.body
            .as_ref()
            .and_then(|body| body.get("data"))
            .ok_or_else(|| Error::bad_request("Request body must have a \"data\" member"))
    }
}

/// A response, to be written out by the transport.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<Document>,
}

impl Response {
    fn document(status: u16, doc: Document) -> Self {
        let mut headers = vec![("Content-Type".to_string(), MEDIA_TYPE.to_string())];
        if let Some(link) = doc.link_header() {
            headers.push(("Link".into(), link));
        }
        Self {
            status,
            headers,
            body: Some(doc),
        }
    }

    fn no_content() -> Self {
        Self {
            status: 204,
            headers: vec![],
            body: None,
        }
    }

    fn error(err: &Error) -> Self {
        Self::document(err.status(), Document::errors(err))
    }

    /// The value of the header `name`, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// The kinds of requests which processors can be attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    GetCollection,
    GetResource,
    GetRelated,
    GetRelationship,
    Post,
    Patch,
    Delete,
    PostRelationship,
    PatchRelationship,
    DeleteRelationship,
}

/// What a processor knows about the request being handled.
#[derive(Clone, Copy, Debug)]
pub struct Context<'a> {
    pub method: Method,
    pub ty: &'a str,
    pub id: Option<&'a str>,
    pub relationship: Option<&'a str>,
    pub request: &'a Request,
    /// For relationship removals, whether the relationship changed.
    pub was_deleted: Option<bool>,
}

/// A preprocessor rejected a request.
#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
#[snafu(display("{detail}"))]
pub struct ProcessingError {
    pub status: u16,
    pub detail: String,
}

impl From<ProcessingError> for Error {
    fn from(err: ProcessingError) -> Self {
        Self::Processing {
            status: err.status,
            detail: err.detail,
        }
    }
}

pub type Preprocessor = Arc<dyn Fn(&Context) -> Result<(), ProcessingError> + Send + Sync>;
pub type Postprocessor = Arc<dyn Fn(&Context, Option<&mut Document>) + Send + Sync>;

/// How one resource type is exposed.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct ResourceConfig {
    /// Serve this type under a different prefix than the API's.
    pub url_prefix: Option<String>,
    /// The HTTP methods clients may use on this type's endpoints, or all of them if `None`.
    pub methods: Option<HashSet<HttpMethod>>,
    pub page_size: usize,
    pub max_page_size: usize,
    /// Relationship paths included when the client does not ask for any.
    pub includes: Vec<String>,
    /// Render only these fields and relationships.
    pub only: Option<Vec<String>>,
    /// Never render these fields and relationships.
    pub exclude: Vec<String>,
    pub allow_to_many_replacement: bool,
    pub allow_delete_from_to_many_relationships: bool,
    pub allow_client_generated_ids: bool,
    pub serializer: Option<Arc<dyn Serializer>>,
    #[derivative(Debug = "ignore")]
    preprocessors: HashMap<Method, Vec<Preprocessor>>,
    #[derivative(Debug = "ignore")]
    postprocessors: HashMap<Method, Vec<Postprocessor>>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            url_prefix: None,
            methods: None,
            page_size: 10,
            max_page_size: 100,
            includes: vec![],
            only: None,
            exclude: vec![],
            allow_to_many_replacement: false,
            allow_delete_from_to_many_relationships: false,
            allow_client_generated_ids: false,
            serializer: None,
            preprocessors: HashMap::new(),
            postprocessors: HashMap::new(),
        }
    }
}

impl ResourceConfig {
    pub fn url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.url_prefix = Some(prefix.into());
        self
    }

    /// Allow only `methods`. Requests with any other method fail with `405 Method Not Allowed`.
    pub fn methods(mut self, methods: impl IntoIterator<Item = HttpMethod>) -> Self {
        self.methods = Some(methods.into_iter().collect());
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn max_page_size(mut self, size: usize) -> Self {
        self.max_page_size = size;
        self
    }

    pub fn include(mut self, path: impl Into<String>) -> Self {
        self.includes.push(path.into());
        self
    }

    /// Render only the fields and relationships in `fields`, besides the ID and type.
    ///
    /// Cannot be combined with [`exclude`](Self::exclude).
    pub fn only<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.only = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Never render the fields and relationships in `fields`.
    pub fn exclude<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.exclude.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn allow_to_many_replacement(mut self, allow: bool) -> Self {
        self.allow_to_many_replacement = allow;
        self
    }

    pub fn allow_delete_from_to_many_relationships(mut self, allow: bool) -> Self {
        self.allow_delete_from_to_many_relationships = allow;
        self
    }

    pub fn allow_client_generated_ids(mut self, allow: bool) -> Self {
        self.allow_client_generated_ids = allow;
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Run `f` before handling requests of kind `method`.
    ///
    /// If `f` fails, the request fails with the status and detail it returns. For requests which
    /// modify data, this happens inside the request's transaction, so nothing is written.
    pub fn preprocessor(
        mut self,
        method: Method,
        f: impl Fn(&Context) -> Result<(), ProcessingError> + Send + Sync + 'static,
    ) -> Self {
        self.preprocessors
            .entry(method)
            .or_default()
            .push(Arc::new(f));
        self
    }

    /// Run `f` on the response document of successful requests of kind `method`.
    pub fn postprocessor(
        mut self,
        method: Method,
        f: impl Fn(&Context, Option<&mut Document>) + Send + Sync + 'static,
    ) -> Self {
        self.postprocessors
            .entry(method)
            .or_default()
            .push(Arc::new(f));
        self
    }

    fn allows(&self, method: HttpMethod) -> bool {
        self.methods
            .as_ref()
            .map_or(true, |methods| methods.contains(&method))
    }

    fn visibility(&self) -> Result<Visibility, Error> {
        match (&self.only, self.exclude.is_empty()) {
            (Some(_), false) => Err(Error::bad_request(
                "Cannot restrict fields with both only and exclude",
            )),
            (Some(only), true) => Ok(Visibility::Only(only.iter().cloned().collect())),
            (None, false) => Ok(Visibility::Exclude(self.exclude.iter().cloned().collect())),
            (None, true) => Ok(Visibility::All),
        }
    }

    fn preprocess(&self, ctx: &Context) -> Result<(), Error> {
        for f in self.preprocessors.get(&ctx.method).into_iter().flatten() {
            f(ctx)?;
        }
        Ok(())
    }

    fn postprocess(&self, ctx: &Context, mut doc: Option<&mut Document>) {
        for f in self.postprocessors.get(&ctx.method).into_iter().flatten() {
            f(ctx, doc.as_deref_mut());
        }
    }
}

/// Settings shared by every resource type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiConfig {
    /// Scheme and authority prepended to links, like `https://example.com`.
    ///
    /// If empty, links are relative to the host of each request.
    pub base_url: String,
    /// The path under which resource types are served by default.
    pub url_prefix: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            url_prefix: "/api".into(),
        }
    }
}

/// A JSON:API request handler.
#[derive(Clone, Debug)]
pub struct Api<D> {
    source: D,
    schema: Arc<Schema>,
    config: ApiConfig,
    resources: HashMap<String, ResourceConfig>,
    assembler: Assembler,
}

/// The part of the URL after a type's collection path.
enum Route<'r> {
    Collection,
    Resource(&'r str),
    Related(&'r str, &'r str),
    Relationship(&'r str, &'r str),
}

/// A registered resource type.
#[derive(Clone, Copy)]
struct Endpoint<'a> {
    ty: &'a EntityType,
    config: &'a ResourceConfig,
}

impl<D: DataSource> Api<D> {
    /// An API serving resources of `schema` stored in `source`.
    ///
    /// No types are exposed until they are registered with [`resource`](Self::resource).
    pub fn new(source: D, schema: Arc<Schema>, config: ApiConfig) -> Self {
        let assembler = Assembler::new(
            schema.clone(),
            format!("{}{}", config.base_url, config.url_prefix),
        );
        Self {
            source,
            schema,
            config,
            resources: HashMap::new(),
            assembler,
        }
    }

    /// Expose the resource type `ty`.
    pub fn resource(mut self, ty: &str, config: ResourceConfig) -> Result<Self, Error> {
        if self.schema.entity(ty).is_none() {
            return Err(Error::not_found(format!("No such type {ty}")));
        }
        let mut assembler = self
            .assembler
            .clone()
            .collection_url(ty, self.collection_path(ty, &config))
            .visibility(ty, config.visibility()?);
        if let Some(serializer) = &config.serializer {
            assembler = assembler.serializer(ty, serializer.clone());
        }
        self.assembler = assembler;
        self.resources.insert(ty.into(), config);
        Ok(self)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Handle a request.
    ///
    /// Each request gets its own session with the data source. Errors are rendered as error
    /// documents.
    pub async fn handle(&self, req: &Request) -> Response {
        tracing::debug!("{} {}", req.method, req.url);
        let source = self.source.clone();
        match self.dispatch(&source, req).await {
            Ok(res) => res,
            Err(err) => {
                if err.status() >= 500 {
                    tracing::error!("{} {} failed: {err}", req.method, req.url);
                } else {
                    tracing::warn!("{} {} failed: {err}", req.method, req.url);
                }
                Response::error(&err)
            }
        }
    }

    fn collection_path(&self, ty: &str, config: &ResourceConfig) -> String {
        let prefix = config
            .url_prefix
            .as_deref()
            .unwrap_or(&self.config.url_prefix)
            .trim_end_matches('/');
        format!("{}{prefix}/{ty}", self.config.base_url)
    }

    /// Find the endpoint and route of a request path.
    fn route<'r>(&'r self, path: &'r str) -> Result<(Endpoint<'r>, Route<'r>), Error> {
        for (name, config) in &self.resources {
            let Some(ty) = self.schema.entity(name) else {
                continue;
            };
            let collection = self.collection_path(name, config);
            let collection = match Url::parse(&collection) {
                Ok(url) => url.path().to_string(),
                Err(_) => collection,
            };
            let Some(rest) = path.trim_end_matches('/').strip_prefix(&collection) else {
                continue;
            };
            let segments = match rest.strip_prefix('/') {
                Some(rest) => rest.split('/').collect::<Vec<_>>(),
                None if rest.is_empty() => vec![],
                None => continue,
            };
            let route = match segments.as_slice() {
                [] => Route::Collection,
                [id] => Route::Resource(*id),
                [id, rel] => Route::Related(*id, *rel),
                [id, "relationships", rel] => Route::Relationship(*id, *rel),
                _ => break,
            };
            return Ok((Endpoint { ty, config }, route));
        }
        Err(Error::not_found(format!("No resource at {path}")))
    }

    async fn dispatch(&self, source: &D, req: &Request) -> Result<Response, Error> {
        let path = req.url.path();
        let (ep, route) = self.route(path)?;
        if !ep.config.allows(req.method) {
            return Err(Error::MethodNotAllowed {
                method: req.method.to_string(),
                path: path.into(),
            });
        }
        match (route, req.method) {
            (Route::Collection, HttpMethod::Get) => self.get_collection(source, ep, req).await,
            (Route::Collection, HttpMethod::Post) => self.post(source, ep, req).await,
            (Route::Resource(id), HttpMethod::Get) => self.get_resource(source, ep, req, id).await,
            (Route::Resource(id), HttpMethod::Patch) => self.patch(source, ep, req, id).await,
            (Route::Resource(id), HttpMethod::Delete) => self.delete(source, ep, req, id).await,
            (Route::Related(id, rel), HttpMethod::Get) => {
                let rel = relationship(ep.ty, rel)?;
                self.get_related(source, ep, req, id, rel).await
            }
            (Route::Relationship(id, rel), method) => {
                let rel = relationship(ep.ty, rel)?;
                match method {
                    HttpMethod::Get => self.get_relationship(source, ep, req, id, rel).await,
                    _ => self.mutate_relationship(source, ep, req, id, rel).await,
                }
            }
            (_, method) => Err(Error::MethodNotAllowed {
                method: method.to_string(),
                path: path.into(),
            }),
        }
    }

    async fn get_collection(
        &self,
        source: &D,
        ep: Endpoint<'_>,
        req: &Request,
    ) -> Result<Response, Error> {
        let ctx = context(Method::GetCollection, ep.ty, req);
        ep.config.preprocess(&ctx)?;

        let params = QueryParams::parse(req.url.query().unwrap_or_default())?;
        let predicate = filter::compile_all(&self.schema, ep.ty, &params.filters)?;
        let ordering = sort::resolve(&self.schema, ep.ty, &params.sort)?;
        let page = params.page(ep.config.page_size, ep.config.max_page_size)?;
        let query = Query {
            predicate,
            ordering,
            window: page.window(),
        };

        let instances = source
            .query(ep.ty, &query)
            .await
            .map_err(Error::backend_read)?;
        let total = if page.is_paginated() {
            source
                .count(ep.ty, &query.predicate)
                .await
                .map_err(Error::backend_read)?
        } else {
            instances.len()
        };
        let page = paginate(total, &page);

        let included = self
            .include(source, ep.ty, ep.config, &params, &instances)
            .await?;
        let mut doc = self
            .assembler
            .assemble(
                source,
                PrimaryData::Collection(instances),
                included,
                Some(&page),
                &req.url,
                &params.fields,
            )
            .await?;
        ep.config.postprocess(&ctx, Some(&mut doc));
        Ok(Response::document(200, doc))
    }

    async fn get_resource(
        &self,
        source: &D,
        ep: Endpoint<'_>,
        req: &Request,
        id: &str,
    ) -> Result<Response, Error> {
        let ctx = Context {
            id: Some(id),
            ..context(Method::GetResource, ep.ty, req)
        };
        ep.config.preprocess(&ctx)?;

        let params = QueryParams::parse(req.url.query().unwrap_or_default())?;
        let instance = require(source, ep.ty, id).await?;
        let roots = [instance];
        let included = self
            .include(source, ep.ty, ep.config, &params, &roots)
            .await?;
        let [instance] = roots;
        let mut doc = self
            .assembler
            .assemble(
                source,
                PrimaryData::Resource(Some(instance)),
                included,
                None,
                &req.url,
                &params.fields,
            )
            .await?;
        ep.config.postprocess(&ctx, Some(&mut doc));
        Ok(Response::document(200, doc))
    }

    async fn get_related(
        &self,
        source: &D,
        ep: Endpoint<'_>,
        req: &Request,
        id: &str,
        rel: &Relationship,
    ) -> Result<Response, Error> {
        let ctx = Context {
            id: Some(id),
            relationship: Some(rel.name()),
            ..context(Method::GetRelated, ep.ty, req)
        };
        ep.config.preprocess(&ctx)?;

        let params = QueryParams::parse(req.url.query().unwrap_or_default())?;
        let target = self.target(rel)?;
        require(source, ep.ty, id).await?;
        let related = load_targets(source, ep.ty, rel, id).await?;

        // Includes, fieldsets and paging are relative to the related type.
        let target_config = self.resources.get(target.name()).unwrap_or(ep.config);
        let (primary, page) = if rel.is_to_many() {
            let page = params.page(target_config.page_size, target_config.max_page_size)?;
            let page = paginate(related.len(), &page);
            let items = related
                .get(page.range())
                .map(<[Instance]>::to_vec)
                .unwrap_or_default();
            (PrimaryData::Collection(items), Some(page))
        } else {
            (
                PrimaryData::Resource(related.into_iter().next()),
                None,
            )
        };
        let roots = match &primary {
            PrimaryData::Collection(items) => items.clone(),
            PrimaryData::Resource(item) => item.iter().cloned().collect(),
        };
        let included = self
            .include(source, target, target_config, &params, &roots)
            .await?;
        let mut doc = self
            .assembler
            .assemble(
                source,
                primary,
                included,
                page.as_ref(),
                &req.url,
                &params.fields,
            )
            .await?;
        ep.config.postprocess(&ctx, Some(&mut doc));
        Ok(Response::document(200, doc))
    }

    async fn get_relationship(
        &self,
        source: &D,
        ep: Endpoint<'_>,
        req: &Request,
        id: &str,
        rel: &Relationship,
    ) -> Result<Response, Error> {
        let ctx = Context {
            id: Some(id),
            relationship: Some(rel.name()),
            ..context(Method::GetRelationship, ep.ty, req)
        };
        ep.config.preprocess(&ctx)?;

        require(source, ep.ty, id).await?;
        let related = load_targets(source, ep.ty, rel, id).await?;
        let linkage = Linkage::from_targets(rel, &related);
        let mut doc = self.assembler.linkage(ep.ty.name(), id, rel, &linkage);
        ep.config.postprocess(&ctx, Some(&mut doc));
        Ok(Response::document(200, doc))
    }

    async fn post(&self, source: &D, ep: Endpoint<'_>, req: &Request) -> Result<Response, Error> {
        let ctx = context(Method::Post, ep.ty, req);
        let data = req.data()?;
        check_type(ep.ty, data)?;

        let mut values = parse_attributes(ep.ty, data)?;
        if let Some(id) = data.get("id") {
            if !ep.config.allow_client_generated_ids {
                return Err(Error::forbidden("Server does not allow client-generated IDs"));
            }
            let id = id_string(id)
                .and_then(|id| ep.ty.parse_id(&id))
                .ok_or_else(|| Error::bad_request(format!("Invalid ID {id}")))?;
            values.insert(ep.ty.id_field().name().into(), id);
        }
        let links = parse_relationships(ep.ty, data)?;

        source.begin().await.map_err(Error::backend_write)?;
        let result = async {
            ep.config.preprocess(&ctx)?;
            let instance = source
                .insert(ep.ty, values)
                .await
                .map_err(Error::backend_write)?;
            for (rel, linkage) in &links {
                self.write_linkage(source, ep.ty, rel, instance.id(), linkage, true)
                    .await?;
            }

            let id = instance.id().to_string();
            let location = self.assembler.url_of_resource(ep.ty.name(), &id);
            let url = req
                .url
                .join(&location)
                .map_err(|err| Error::bad_request(err.to_string()))?;
            let mut doc = self
                .assembler
                .assemble(
                    source,
                    PrimaryData::Resource(Some(instance)),
                    None,
                    None,
                    &url,
                    &Fieldsets::new(),
                )
                .await?;
            let ctx = Context {
                id: Some(&id),
                ..ctx
            };
            ep.config.postprocess(&ctx, Some(&mut doc));
            Ok::<_, Error>((url, doc))
        }
        .await;
        let (url, doc) = finish(source, result).await?;

        let mut res = Response::document(201, doc);
        res.headers.push(("Location".into(), url.to_string()));
        Ok(res)
    }

    async fn patch(
        &self,
        source: &D,
        ep: Endpoint<'_>,
        req: &Request,
        id: &str,
    ) -> Result<Response, Error> {
        let ctx = Context {
            id: Some(id),
            ..context(Method::Patch, ep.ty, req)
        };
        let data = req.data()?;
        check_type(ep.ty, data)?;
        match data.get("id").and_then(id_string) {
            Some(body_id) if body_id == id => {}
            Some(body_id) => {
                return Err(Error::conflict(format!("ID must be {id}, not {body_id}")))
            }
            None => {
                return Err(Error::bad_request(
                    "Resource object must have an \"id\" member",
                ))
            }
        }
        let values = parse_attributes(ep.ty, data)?;
        let links = parse_relationships(ep.ty, data)?;

        source.begin().await.map_err(Error::backend_write)?;
        let result = async {
            ep.config.preprocess(&ctx)?;
            let exists = source
                .update(ep.ty, id, values)
                .await
                .map_err(Error::backend_write)?;
            if !exists {
                return Err(Error::no_resource(ep.ty.name(), id));
            }
            for (rel, linkage) in &links {
                self.write_linkage(
                    source,
                    ep.ty,
                    rel,
                    id,
                    linkage,
                    ep.config.allow_to_many_replacement,
                )
                .await?;
            }
            ep.config.postprocess(&ctx, None);
            Ok::<_, Error>(())
        }
        .await;
        finish(source, result).await?;
        Ok(Response::no_content())
    }

    async fn delete(
        &self,
        source: &D,
        ep: Endpoint<'_>,
        req: &Request,
        id: &str,
    ) -> Result<Response, Error> {
        let ctx = Context {
            id: Some(id),
            ..context(Method::Delete, ep.ty, req)
        };

        source.begin().await.map_err(Error::backend_write)?;
        let result = async {
            ep.config.preprocess(&ctx)?;
            let deleted = source
                .delete(ep.ty, id)
                .await
                .map_err(Error::backend_write)?;
            if !deleted {
                return Err(Error::no_resource(ep.ty.name(), id));
            }
            ep.config.postprocess(&ctx, None);
            Ok::<_, Error>(())
        }
        .await;
        finish(source, result).await?;
        Ok(Response::no_content())
    }

    async fn mutate_relationship(
        &self,
        source: &D,
        ep: Endpoint<'_>,
        req: &Request,
        id: &str,
        rel: &Relationship,
    ) -> Result<Response, Error> {
        let method = match req.method {
            HttpMethod::Post => Method::PostRelationship,
            HttpMethod::Patch => Method::PatchRelationship,
            _ => Method::DeleteRelationship,
        };
        let ctx = Context {
            id: Some(id),
            relationship: Some(rel.name()),
            ..context(method, ep.ty, req)
        };
        if method != Method::PatchRelationship && !rel.is_to_many() {
            return Err(Error::forbidden(format!(
                "Can not {} the to-one relationship {}",
                if method == Method::PostRelationship {
                    "add to"
                } else {
                    "remove from"
                },
                rel.name()
            )));
        }
        let linkage = Linkage::parse(rel, req.data()?)?;

        source.begin().await.map_err(Error::backend_write)?;
        let result = async {
            ep.config.preprocess(&ctx)?;
            require(source, ep.ty, id).await?;
            let was_deleted = match method {
                Method::PostRelationship => {
                    mutate::append_to_many(
                        source,
                        &self.schema,
                        ep.ty,
                        rel,
                        id,
                        linkage.identifiers(),
                    )
                    .await?;
                    None
                }
                Method::PatchRelationship => {
                    self.write_linkage(
                        source,
                        ep.ty,
                        rel,
                        id,
                        &linkage,
                        ep.config.allow_to_many_replacement,
                    )
                    .await?;
                    None
                }
                _ => Some(
                    mutate::remove_from_many(
                        source,
                        &self.schema,
                        ep.ty,
                        rel,
                        id,
                        linkage.identifiers(),
                        ep.config.allow_delete_from_to_many_relationships,
                    )
                    .await?,
                ),
            };
            ep.config.postprocess(&Context { was_deleted, ..ctx }, None);
            Ok::<_, Error>(())
        }
        .await;
        finish(source, result).await?;
        Ok(Response::no_content())
    }

    /// Replace the linkage of `rel` for `owner`.
    async fn write_linkage(
        &self,
        source: &D,
        ty: &EntityType,
        rel: &Relationship,
        owner: &str,
        linkage: &Linkage,
        allow_to_many_replacement: bool,
    ) -> Result<(), Error> {
        match linkage {
            Linkage::ToOne(target) => {
                mutate::replace_to_one(source, &self.schema, ty, rel, owner, target.as_ref())
                    .await
            }
            Linkage::ToMany(targets) => {
                mutate::replace_to_many(
                    source,
                    &self.schema,
                    ty,
                    rel,
                    owner,
                    targets,
                    allow_to_many_replacement,
                )
                .await
            }
        }
    }

    /// Resolve the included resources for a request, if any inclusion applies.
    async fn include(
        &self,
        source: &D,
        ty: &EntityType,
        config: &ResourceConfig,
        params: &QueryParams,
        roots: &[Instance],
    ) -> Result<Option<Vec<Instance>>, Error> {
        let paths = params.include.as_ref().unwrap_or(&config.includes);
        if paths.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            include::resolve(source, &self.schema, ty, roots, paths).await?,
        ))
    }

    fn target(&self, rel: &Relationship) -> Result<&EntityType, Error> {
        self.schema
            .entity(rel.target())
            .ok_or_else(|| Error::not_found(format!("No such type {}", rel.target())))
    }
}

fn context<'a>(method: Method, ty: &'a EntityType, request: &'a Request) -> Context<'a> {
    Context {
        method,
        ty: ty.name(),
        id: None,
        relationship: None,
        request,
        was_deleted: None,
    }
}

fn relationship<'a>(ty: &'a EntityType, name: &str) -> Result<&'a Relationship, Error> {
    ty.get_relationship(name).ok_or_else(|| {
        Error::not_found(format!("No relationship {name} on type {}", ty.name()))
    })
}

/// Load the resource `id` of type `ty`, failing if it does not exist.
async fn require<D: DataSource>(source: &D, ty: &EntityType, id: &str) -> Result<Instance, Error> {
    source
        .get(ty, &[id.to_string()])
        .await
        .map_err(Error::backend_read)?
        .pop()
        .ok_or_else(|| Error::no_resource(ty.name(), id))
}

async fn load_targets<D: DataSource>(
    source: &D,
    ty: &EntityType,
    rel: &Relationship,
    id: &str,
) -> Result<Vec<Instance>, Error> {
    Ok(source
        .load_relation(ty, rel, &[id.to_string()])
        .await
        .map_err(Error::backend_read)?
        .remove(id)
        .unwrap_or_default())
}

/// Commit the request's transaction if it succeeded, or roll it back if it failed.
async fn finish<D: DataSource, T>(source: &D, result: Result<T, Error>) -> Result<T, Error> {
    match result {
        Ok(value) => {
            source.commit().await.map_err(Error::backend_write)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = source.rollback().await {
                tracing::error!("rollback failed after {err}: {rollback}");
            }
            Err(err)
        }
    }
}

fn id_string(id: &Json) -> Option<String> {
    match id {
        Json::String(id) => Some(id.clone()),
        Json::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Check the `type` member of a resource object.
fn check_type(ty: &EntityType, data: &Json) -> Result<(), Error> {
    match data.get("type").and_then(Json::as_str) {
        Some(name) if name == ty.name() => Ok(()),
        Some(name) => Err(Error::conflict(format!(
            "Type must be {}, not {name}",
            ty.name()
        ))),
        None => Err(Error::bad_request(
            "Resource object must have a \"type\" member",
        )),
    }
}

fn members<'a>(data: &'a Json, member: &str) -> Result<Option<&'a Map<String, Json>>, Error> {
    match data.get(member) {
        None => Ok(None),
        Some(Json::Object(map)) => Ok(Some(map)),
        Some(_) => Err(Error::bad_request(format!(
            "The \"{member}\" member must be an object"
        ))),
    }
}

/// Convert the `attributes` of a resource object into field values.
fn parse_attributes(ty: &EntityType, data: &Json) -> Result<BTreeMap<String, Value>, Error> {
    let mut values = BTreeMap::new();
    for (name, json) in members(data, "attributes")?.into_iter().flatten() {
        let field = ty
            .attributes()
            .iter()
            .find(|field| field.name() == name)
            .ok_or_else(|| {
                Error::bad_request(format!("Type {} has no attribute {name}", ty.name()))
            })?;
        let value = Value::from_json(field.ty(), json).ok_or_else(|| {
            Error::bad_request(format!("{json} is not a valid {} for attribute {name}", field.ty()))
        })?;
        values.insert(name.clone(), value);
    }
    Ok(values)
}

/// Parse the `relationships` of a resource object.
fn parse_relationships<'a>(
    ty: &'a EntityType,
    data: &Json,
) -> Result<Vec<(&'a Relationship, Linkage)>, Error> {
    members(data, "relationships")?
        .into_iter()
        .flatten()
        .map(|(name, rel_object)| {
            let rel = ty.get_relationship(name).ok_or_else(|| {
                Error::bad_request(format!("Type {} has no relationship {name}", ty.name()))
            })?;
            let data = rel_object.get("data").ok_or_else(|| {
                Error::bad_request(format!("Relationship {name} must have a \"data\" member"))
            })?;
            Ok::<_, Error>((rel, Linkage::parse(rel, data)?))
        })
        .collect()
}

#[cfg(all(test, feature = "sql"))]
mod test {
    use super::*;
    use crate::{
        init_logging,
        jsonapi::test::{blog_source, Source},
    };
    use serde_json::json;
    use std::sync::Mutex;

    async fn api(config: impl Fn(&str) -> ResourceConfig) -> Api<Source> {
        let source = blog_source().await;
        let schema = source.schema().clone();
        let mut api = Api::new(source, schema, ApiConfig::default());
        for ty in ["person", "article", "comment", "tag"] {
            api = api.resource(ty, config(ty)).unwrap();
        }
        api
    }

    fn request(method: HttpMethod, path: &str) -> Request {
        Request::new(
            method,
            Url::parse(&format!("http://example.com{path}")).unwrap(),
        )
    }

    async fn get(api: &Api<Source>, path: &str) -> (u16, Json) {
        send(api, request(HttpMethod::Get, path)).await
    }

    async fn send(api: &Api<Source>, req: Request) -> (u16, Json) {
        let res = api.handle(&req).await;
        let body = res
            .body
            .as_ref()
            .map(|doc| serde_json::to_value(doc).unwrap())
            .unwrap_or(Json::Null);
        (res.status, body)
    }

    fn ids(data: &Json) -> Vec<&str> {
        data.as_array()
            .unwrap()
            .iter()
            .map(|item| item["id"].as_str().unwrap())
            .collect()
    }

    #[async_std::test]
    async fn test_get_collection() {
        init_logging();
        let api = api(|_| ResourceConfig::default().page_size(2)).await;

        let res = api.handle(&request(HttpMethod::Get, "/api/person")).await;
        assert_eq!(res.status, 200);
        assert_eq!(res.header("content-type"), Some(MEDIA_TYPE));
        assert!(res.header("Link").unwrap().contains("rel=\"next\""));
        let body = serde_json::to_value(res.body.unwrap()).unwrap();
        assert_eq!(ids(&body["data"]), ["1", "2"]);
        assert_eq!(body["meta"]["total"], 3);
        assert_eq!(body["links"]["prev"], Json::Null);
        assert!(body.get("included").is_none());

        let (status, body) = get(&api, "/api/person?page[number]=2").await;
        assert_eq!(status, 200);
        assert_eq!(ids(&body["data"]), ["3"]);
        assert_eq!(body["links"]["next"], Json::Null);

        // Page size 0 returns everything.
        let (_, body) = get(&api, "/api/person?page[size]=0").await;
        assert_eq!(ids(&body["data"]), ["1", "2", "3"]);
        assert_eq!(body["meta"]["total"], 3);
        assert_eq!(body["links"]["first"], Json::Null);
    }

    #[async_std::test]
    async fn test_filter_and_sort() {
        init_logging();
        let api = api(|_| ResourceConfig::default()).await;

        let (status, body) = get(
            &api,
            r#"/api/person?filter[objects]=[{"name":"age","op":"gt","val":18},{"name":"name","op":"like","val":"%a%"}]&sort=-age"#,
        )
        .await;
        assert_eq!(status, 200, "{body}");
        assert_eq!(ids(&body["data"]), ["1", "3"]);
        assert_eq!(body["meta"]["total"], 2);

        let (status, body) = get(
            &api,
            r#"/api/article?filter[objects]=[{"name":"author","op":"has","val":{"name":"name","op":"eq","val":"alice"}}]&sort=-title"#,
        )
        .await;
        assert_eq!(status, 200, "{body}");
        assert_eq!(ids(&body["data"]), ["2", "1"]);

        let (status, body) = get(&api, "/api/comment?sort=author.name").await;
        assert_eq!(status, 200, "{body}");
        assert_eq!(ids(&body["data"]), ["3", "1", "2"]);

        // Every person, even one without an age, is outside an empty list.
        let (status, body) = get(
            &api,
            r#"/api/person?filter[objects]=[{"name":"age","op":"not_in","val":[]}]"#,
        )
        .await;
        assert_eq!(status, 200, "{body}");
        assert_eq!(ids(&body["data"]), ["1", "2", "3"]);
        let (_, body) = get(
            &api,
            r#"/api/person?filter[objects]=[{"name":"age","op":"in","val":[]}]"#,
        )
        .await;
        assert_eq!(ids(&body["data"]), Vec::<&str>::new());
    }

    #[async_std::test]
    async fn test_sort_ties() {
        init_logging();
        let api = api(|_| ResourceConfig::default()).await;
        let (status, _) = send(
            &api,
            request(HttpMethod::Post, "/api/person").with_body(json!({
                "data": {"type": "person", "attributes": {"name": "aaron", "age": 30}},
            })),
        )
        .await;
        assert_eq!(status, 201);

        // Nulls first, then age descending, ties broken by name.
        let (_, body) = get(&api, "/api/person?sort=-age,name").await;
        assert_eq!(ids(&body["data"]), ["2", "4", "1", "3"]);
    }

    #[async_std::test]
    async fn test_bad_queries() {
        init_logging();
        let api = api(|_| ResourceConfig::default()).await;

        let (status, body) = get(
            &api,
            r#"/api/person?filter[objects]=[{"name":"bogus","op":"eq","val":1}]"#,
        )
        .await;
        assert_eq!(status, 400);
        assert!(body.get("data").is_none());
        assert_eq!(body["errors"][0]["status"], "400");
        assert!(body["errors"][0]["detail"].as_str().unwrap().contains("bogus"));

        let (status, body) = get(
            &api,
            r#"/api/person?filter[objects]=[{"name":"age","op":"eq","val":null}]"#,
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(
            body["errors"][0]["detail"],
            "To compare a value to NULL, use the is_null/is_not_null operators."
        );

        let (status, body) = get(&api, "/api/person?sort=bogus").await;
        assert_eq!(status, 400);
        assert_eq!(
            body["errors"][0]["detail"],
            "Invalid sorting: No such field bogus"
        );

        let (status, body) = get(&api, "/api/person?page[size]=0&page[number]=2").await;
        assert_eq!(status, 400);
        assert_eq!(
            body["errors"][0]["detail"],
            "Page number can not be used with page size 0"
        );

        let (status, _) = get(&api, "/api/person?page[size]=1000").await;
        assert_eq!(status, 400);
        let (status, _) = get(&api, "/api/person?include=bogus").await;
        assert_eq!(status, 400);
    }

    #[async_std::test]
    async fn test_get_resource() {
        init_logging();
        let api = api(|ty| match ty {
            "article" => ResourceConfig::default().include("author"),
            _ => ResourceConfig::default(),
        })
        .await;

        let (status, body) = get(&api, "/api/article/1").await;
        assert_eq!(status, 200);
        assert_eq!(body["data"]["attributes"]["title"], "Hello");
        assert_eq!(body["links"]["self"], "http://example.com/api/article/1");
        assert_eq!(
            body["data"]["links"]["self"],
            "/api/article/1"
        );
        assert_eq!(ids(&body["included"]), ["1"]);

        // The client's includes replace the default.
        let (_, body) = get(&api, "/api/article/2?include=comments.author").await;
        assert_eq!(
            body["included"],
            json!([{"id": "3", "type": "comment", "attributes": {"body": "meh"},
                "relationships": {
                    "article": {
                        "data": {"type": "article", "id": "2"},
                        "links": {
                            "self": "/api/comment/3/relationships/article",
                            "related": "/api/comment/3/article",
                        },
                    },
                    "author": {
                        "data": null,
                        "links": {
                            "self": "/api/comment/3/relationships/author",
                            "related": "/api/comment/3/author",
                        },
                    },
                },
                "links": {"self": "/api/comment/3"},
            }])
        );
        let (_, body) = get(&api, "/api/article/1?include=").await;
        assert!(body.get("included").is_none());

        let (_, body) = get(&api, "/api/article/1?fields[article]=title&include=").await;
        assert_eq!(
            body["data"],
            json!({"id": "1", "type": "article", "attributes": {"title": "Hello"}})
        );

        let (status, body) = get(&api, "/api/article/42").await;
        assert_eq!(status, 404);
        assert_eq!(
            body["errors"][0]["detail"],
            "No resource with ID 42 and type article"
        );
    }

    #[async_std::test]
    async fn test_get_related() {
        init_logging();
        let api = api(|_| ResourceConfig::default()).await;

        let (status, body) = get(&api, "/api/article/1/comments").await;
        assert_eq!(status, 200);
        assert_eq!(ids(&body["data"]), ["1", "2"]);
        assert_eq!(body["meta"]["total"], 2);

        let (_, body) = get(&api, "/api/person/1/articles?page[size]=1&page[number]=2").await;
        assert_eq!(ids(&body["data"]), ["2"]);
        assert_eq!(body["meta"]["total"], 2);

        let (status, body) = get(&api, "/api/comment/3/author").await;
        assert_eq!(status, 200);
        assert_eq!(body["data"], Json::Null);

        let (_, body) = get(&api, "/api/comment/1/author?include=articles").await;
        assert_eq!(body["data"]["id"], "2");
        assert_eq!(body["included"], json!([]));

        let (status, _) = get(&api, "/api/comment/1/bogus").await;
        assert_eq!(status, 404);
        let (status, _) = get(&api, "/api/comment/42/author").await;
        assert_eq!(status, 404);
    }

    #[async_std::test]
    async fn test_get_relationship() {
        init_logging();
        let api = api(|_| ResourceConfig::default()).await;

        let (status, body) = get(&api, "/api/article/2/relationships/tags").await;
        assert_eq!(status, 200);
        assert_eq!(
            body["data"],
            json!([{"type": "tag", "id": "news"}, {"type": "tag", "id": "tech"}])
        );
        assert_eq!(
            body["links"],
            json!({
                "self": "/api/article/2/relationships/tags",
                "related": "/api/article/2/tags",
            })
        );

        let (_, body) = get(&api, "/api/article/1/relationships/author").await;
        assert_eq!(body["data"], json!({"type": "person", "id": "1"}));
    }

    #[async_std::test]
    async fn test_post() {
        init_logging();
        let api = api(|ty| match ty {
            "tag" => ResourceConfig::default().allow_client_generated_ids(true),
            _ => ResourceConfig::default(),
        })
        .await;

        let res = api
            .handle(&request(HttpMethod::Post, "/api/article").with_body(json!({
                "data": {
                    "type": "article",
                    "attributes": {"title": "New", "published": "2022-02-02T10:00:00"},
                    "relationships": {
                        "author": {"data": {"type": "person", "id": "2"}},
                        "tags": {"data": [{"type": "tag", "id": "tech"}]},
                    },
                },
            })))
            .await;
        assert_eq!(res.status, 201);
        assert_eq!(
            res.header("Location"),
            Some("http://example.com/api/article/4")
        );
        let body = serde_json::to_value(res.body.unwrap()).unwrap();
        assert_eq!(body["data"]["id"], "4");
        assert_eq!(body["data"]["attributes"]["published"], "2022-02-02T10:00:00");
        assert_eq!(
            body["data"]["relationships"]["tags"]["data"],
            json!([{"type": "tag", "id": "tech"}])
        );
        let (_, body) = get(&api, "/api/person/2/relationships/articles").await;
        assert_eq!(body["data"], json!([{"type": "article", "id": "4"}]));

        let (status, body) = send(
            &api,
            request(HttpMethod::Post, "/api/tag").with_body(json!({
                "data": {"type": "tag", "id": "misc", "attributes": {"color": "red"}},
            })),
        )
        .await;
        assert_eq!(status, 201, "{body}");
        assert_eq!(body["data"]["id"], "misc");
    }

    #[async_std::test]
    async fn test_post_errors() {
        init_logging();
        let api = api(|_| ResourceConfig::default()).await;
        let post = |body: Json| request(HttpMethod::Post, "/api/person").with_body(body);

        // A unique constraint violation is a conflict, and nothing is created.
        let (status, body) = send(
            &api,
            post(json!({"data": {"type": "person", "attributes": {"name": "alice"}}})),
        )
        .await;
        assert_eq!(status, 409, "{body}");
        let (_, body) = get(&api, "/api/person").await;
        assert_eq!(body["meta"]["total"], 3);

        let (status, _) = send(
            &api,
            post(json!({"data": {"type": "article", "attributes": {"title": "x"}}})),
        )
        .await;
        assert_eq!(status, 409);
        let (status, _) = send(&api, post(json!({"data": {"attributes": {}}}))).await;
        assert_eq!(status, 400);
        let (status, _) = send(&api, post(json!({"nodata": {}}))).await;
        assert_eq!(status, 400);
        let (status, _) = send(
            &api,
            post(json!({"data": {"type": "person", "id": "10"}})),
        )
        .await;
        assert_eq!(status, 403);
        let (status, _) = send(
            &api,
            post(json!({"data": {"type": "person", "attributes": {"bogus": 1}}})),
        )
        .await;
        assert_eq!(status, 400);
        let (status, _) = send(
            &api,
            post(json!({"data": {"type": "person", "attributes": {"age": "old"}}})),
        )
        .await;
        assert_eq!(status, 400);

        // A missing related resource rolls back the insert.
        let (status, _) = send(
            &api,
            post(json!({"data": {
                "type": "person",
                "attributes": {"name": "dave"},
                "relationships": {"articles": {"data": [{"type": "article", "id": "42"}]}},
            }})),
        )
        .await;
        assert_eq!(status, 404);
        let (_, body) = get(&api, "/api/person").await;
        assert_eq!(body["meta"]["total"], 3);
    }

    #[async_std::test]
    async fn test_patch() {
        init_logging();
        let api = api(|ty| match ty {
            "article" => ResourceConfig::default().allow_to_many_replacement(true),
            _ => ResourceConfig::default(),
        })
        .await;
        let patch = |path: &str, body: Json| request(HttpMethod::Patch, path).with_body(body);

        let (status, _) = send(
            &api,
            patch(
                "/api/article/3",
                json!({"data": {
                    "type": "article",
                    "id": "3",
                    "attributes": {"title": "Adopted"},
                    "relationships": {
                        "author": {"data": {"type": "person", "id": "3"}},
                        "tags": {"data": [{"type": "tag", "id": "news"}]},
                    },
                }}),
            ),
        )
        .await;
        assert_eq!(status, 204);
        let (_, body) = get(&api, "/api/article/3").await;
        assert_eq!(body["data"]["attributes"]["title"], "Adopted");
        assert_eq!(
            body["data"]["relationships"]["author"]["data"],
            json!({"type": "person", "id": "3"})
        );
        assert_eq!(
            body["data"]["relationships"]["tags"]["data"],
            json!([{"type": "tag", "id": "news"}])
        );

        let (status, _) = send(
            &api,
            patch("/api/article/3", json!({"data": {"type": "article", "id": "2"}})),
        )
        .await;
        assert_eq!(status, 409);
        let (status, _) = send(
            &api,
            patch("/api/article/42", json!({"data": {"type": "article", "id": "42"}})),
        )
        .await;
        assert_eq!(status, 404);

        // People may not replace their articles wholesale.
        let (status, _) = send(
            &api,
            patch(
                "/api/person/1",
                json!({"data": {
                    "type": "person",
                    "id": "1",
                    "attributes": {"name": "alicia"},
                    "relationships": {"articles": {"data": []}},
                }}),
            ),
        )
        .await;
        assert_eq!(status, 403);
        let (_, body) = get(&api, "/api/person/1").await;
        assert_eq!(body["data"]["attributes"]["name"], "alice");
    }

    #[async_std::test]
    async fn test_delete() {
        init_logging();
        let api = api(|_| ResourceConfig::default()).await;

        let (status, body) = send(&api, request(HttpMethod::Delete, "/api/article/1")).await;
        assert_eq!(status, 204);
        assert_eq!(body, Json::Null);
        let (status, _) = get(&api, "/api/article/1").await;
        assert_eq!(status, 404);
        let (_, body) = get(&api, "/api/comment/1/relationships/article").await;
        assert_eq!(body["data"], Json::Null);

        let (status, _) = send(&api, request(HttpMethod::Delete, "/api/article/1")).await;
        assert_eq!(status, 404);
    }

    #[async_std::test]
    async fn test_relationship_mutations() {
        init_logging();
        let was_deleted = Arc::new(Mutex::new(vec![]));
        let log = was_deleted.clone();
        let api = api(move |ty| match ty {
            "article" => {
                let log = log.clone();
                ResourceConfig::default()
                    .allow_delete_from_to_many_relationships(true)
                    .postprocessor(Method::DeleteRelationship, move |ctx, _| {
                        log.lock().unwrap().push(ctx.was_deleted);
                    })
            }
            _ => ResourceConfig::default(),
        })
        .await;
        let tags = |method, tags: &[&str]| {
            request(method, "/api/article/1/relationships/tags").with_body(json!({
                "data": tags
                    .iter()
                    .map(|id| json!({"type": "tag", "id": id}))
                    .collect::<Vec<_>>(),
            }))
        };

        let (status, _) = send(&api, tags(HttpMethod::Post, &["tech", "news"])).await;
        assert_eq!(status, 204);
        let (_, body) = get(&api, "/api/article/1/relationships/tags").await;
        assert_eq!(body["data"].as_array().unwrap().len(), 2);

        let (status, _) = send(&api, tags(HttpMethod::Delete, &["news"])).await;
        assert_eq!(status, 204);
        let (status, _) = send(&api, tags(HttpMethod::Delete, &["news"])).await;
        assert_eq!(status, 204);
        assert_eq!(*was_deleted.lock().unwrap(), [Some(true), Some(false)]);
        let (_, body) = get(&api, "/api/article/1/relationships/tags").await;
        assert_eq!(body["data"], json!([{"type": "tag", "id": "tech"}]));

        // To-many replacement is not enabled.
        let (status, _) = send(&api, tags(HttpMethod::Patch, &[])).await;
        assert_eq!(status, 403);

        let (status, _) = send(
            &api,
            request(HttpMethod::Patch, "/api/article/1/relationships/author")
                .with_body(json!({"data": null})),
        )
        .await;
        assert_eq!(status, 204);
        let (_, body) = get(&api, "/api/article/1/author").await;
        assert_eq!(body["data"], Json::Null);

        let (status, _) = send(
            &api,
            request(HttpMethod::Post, "/api/article/1/relationships/author")
                .with_body(json!({"data": {"type": "person", "id": "1"}})),
        )
        .await;
        assert_eq!(status, 403);
        let (status, _) = send(&api, tags(HttpMethod::Post, &["bogus"])).await;
        assert_eq!(status, 404);

        // People can't remove from their relationships.
        let (status, _) = send(
            &api,
            request(HttpMethod::Delete, "/api/person/1/relationships/articles")
                .with_body(json!({"data": [{"type": "article", "id": "1"}]})),
        )
        .await;
        assert_eq!(status, 403);
    }

    #[async_std::test]
    async fn test_processors() {
        init_logging();
        let api = api(|_| {
            ResourceConfig::default()
                .preprocessor(Method::Post, |ctx| {
                    Err(ProcessingError {
                        status: 418,
                        detail: format!("no new {}", ctx.ty),
                    })
                })
                .postprocessor(Method::GetCollection, |_, doc| {
                    if let Some(doc) = doc {
                        doc.meta.insert("processed".into(), true.into());
                    }
                })
        })
        .await;

        let (status, body) = send(
            &api,
            request(HttpMethod::Post, "/api/person").with_body(json!({
                "data": {"type": "person", "attributes": {"name": "dave"}},
            })),
        )
        .await;
        assert_eq!(status, 418);
        assert_eq!(body["errors"][0]["detail"], "no new person");

        let (_, body) = get(&api, "/api/person").await;
        assert_eq!(body["meta"], json!({"total": 3, "processed": true}));
    }

    #[test]
    fn test_resource_config_debug() {
        let config = ResourceConfig::default()
            .page_size(5)
            .exclude(["age"])
            .preprocessor(Method::Delete, |_| Ok(()));
        let debug = format!("{config:?}");
        assert!(debug.contains("page_size: 5"), "{debug}");
        assert!(debug.contains("exclude: [\"age\"]"), "{debug}");
        assert!(!debug.contains("preprocessors"), "{debug}");
    }

    #[async_std::test]
    async fn test_allowed_methods() {
        init_logging();
        let api = api(|ty| match ty {
            "person" => ResourceConfig::default().methods([HttpMethod::Get]),
            "comment" => ResourceConfig::default().methods(Vec::new()),
            _ => ResourceConfig::default(),
        })
        .await;

        let (status, _) = get(&api, "/api/person/1/relationships/articles").await;
        assert_eq!(status, 200);
        let (status, body) = send(
            &api,
            request(HttpMethod::Post, "/api/person").with_body(json!({
                "data": {"type": "person", "attributes": {"name": "dave"}},
            })),
        )
        .await;
        assert_eq!(status, 405);
        assert_eq!(body["errors"][0]["title"], "Method Not Allowed");
        for (method, path) in [
            (HttpMethod::Patch, "/api/person/1"),
            (HttpMethod::Delete, "/api/person/1"),
            (HttpMethod::Delete, "/api/person/1/relationships/articles"),
        ] {
            let (status, _) = send(&api, request(method, path)).await;
            assert_eq!(status, 405, "{method} {path}");
        }
        let (_, body) = get(&api, "/api/person").await;
        assert_eq!(body["meta"]["total"], 3);

        for method in [
            HttpMethod::Get,
            HttpMethod::Post,
            HttpMethod::Patch,
            HttpMethod::Delete,
        ] {
            let (status, _) = send(&api, request(method, "/api/comment")).await;
            assert_eq!(status, 405, "{method}");
        }

        // Other types are unaffected.
        let (status, _) = send(&api, request(HttpMethod::Delete, "/api/article/3")).await;
        assert_eq!(status, 204);
    }

    #[async_std::test]
    async fn test_only_and_exclude() {
        init_logging();
        let api = api(|ty| match ty {
            "person" => ResourceConfig::default().only(["name", "articles"]),
            "article" => ResourceConfig::default().exclude(["published", "comments", "tags"]),
            _ => ResourceConfig::default(),
        })
        .await;

        let (status, body) = get(&api, "/api/person/1").await;
        assert_eq!(status, 200, "{body}");
        assert_eq!(body["data"]["attributes"], json!({"name": "alice"}));
        assert!(body["data"]["relationships"].get("comments").is_none());
        assert_eq!(ids(&body["data"]["relationships"]["articles"]["data"]), ["1", "2"]);

        // The restriction also applies to included resources and sparse fieldsets.
        let (status, body) = get(
            &api,
            "/api/article/1?include=author&fields[person]=age,name",
        )
        .await;
        assert_eq!(status, 200, "{body}");
        assert_eq!(body["data"]["attributes"], json!({"title": "Hello"}));
        assert_eq!(
            body["data"]["relationships"]
                .as_object()
                .unwrap()
                .keys()
                .collect::<Vec<_>>(),
            ["author"]
        );
        assert_eq!(body["included"][0]["attributes"], json!({"name": "alice"}));

        // Hidden fields can still be filtered on.
        let (_, body) = get(
            &api,
            r#"/api/person?filter[objects]=[{"name":"age","op":"lt","val":25}]"#,
        )
        .await;
        assert_eq!(ids(&body["data"]), ["3"]);

        let source = blog_source().await;
        let schema = source.schema().clone();
        let err = Api::new(source, schema, ApiConfig::default())
            .resource("person", ResourceConfig::default().only(["name"]).exclude(["age"]))
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[async_std::test]
    async fn test_routing() {
        init_logging();
        let source = blog_source().await;
        let schema = source.schema().clone();
        let api = Api::new(
            source,
            schema,
            ApiConfig {
                base_url: "https://example.org".into(),
                url_prefix: "/api".into(),
            },
        )
        .resource("person", ResourceConfig::default())
        .unwrap()
        .resource("article", ResourceConfig::default().url_prefix("/v2"))
        .unwrap();
        assert!(api
            .clone()
            .resource("bogus", ResourceConfig::default())
            .is_err());

        let (status, body) = get(&api, "/api/person/1").await;
        assert_eq!(status, 200);
        assert_eq!(
            body["data"]["relationships"]["articles"]["links"]["related"],
            "https://example.org/api/person/1/articles"
        );
        assert_eq!(
            body["data"]["relationships"]["articles"]["data"][0]["id"],
            "1"
        );
        let (status, _) = get(&api, "/v2/article/1").await;
        assert_eq!(status, 200);
        let (status, _) = get(&api, "/api/article/1").await;
        assert_eq!(status, 404);
        let (status, _) = get(&api, "/api/comment").await;
        assert_eq!(status, 404);
        let (status, _) = get(&api, "/api/personnel").await;
        assert_eq!(status, 404);
        let (status, _) = get(&api, "/api/person/1/relationships/articles/extra").await;
        assert_eq!(status, 404);

        let (status, body) = send(&api, request(HttpMethod::Delete, "/api/person")).await;
        assert_eq!(status, 405);
        assert_eq!(body["errors"][0]["title"], "Method Not Allowed");
        let (status, _) = send(&api, request(HttpMethod::Post, "/api/person/1")).await;
        assert_eq!(status, 405);
    }
}
